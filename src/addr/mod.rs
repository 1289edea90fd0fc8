//! IPv4 and hardware address utilities
//!
//! Pure helpers shared by the ARP, ping and DHCP components:
//! - `MacAddress` parsing and formatting
//! - Subnet arithmetic (`Ipv4Ext`, `Ipv4Subnet`)
//! - Inclusive address range iteration (`Ipv4Range`)

pub mod mac;
pub mod subnet;

pub use mac::MacAddress;
pub use subnet::{
    mask_from_prefix, Ipv4Ext, Ipv4Range, Ipv4Subnet, SUBNET_CLASS_A, SUBNET_CLASS_B,
    SUBNET_CLASS_C,
};
