//! # Lanwatch - Passive Network Device Discovery
//!
//! Lanwatch finds the devices on a local IPv4 network by combining three
//! sources of evidence:
//!
//! - DHCP traffic, tracked per client by a passive listener on UDP 67
//! - The operating system's ARP table, polled through the `arp` tool
//! - ICMP echo sweeps of a subnet, which also prime the ARP table
//!
//! Every successful DHCP request produces a `DiscoveredDevice`. When the
//! request itself carried no address, the engine resolves one from the ARP
//! cache before publishing.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lanwatch::{DiscoveryEngine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DiscoveryEngine::new(EngineConfig::default())?;
//!     let mut devices = engine.subscribe_devices();
//!     engine.start().await?;
//!     while let Some(device) = devices.recv().await {
//!         println!("{} -> {:?}", device.physical_address, device.ip_address);
//!     }
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod addr;
pub mod arp;
pub mod config;
pub mod dhcp;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod ping;

pub use addr::{Ipv4Ext, Ipv4Range, Ipv4Subnet, MacAddress};
pub use arp::{ArpRefreshStatus, ArpService};
pub use config::{Args, ArpConfig, DhcpConfig, EngineConfig, PingConfig};
pub use dhcp::{DeviceType, DhcpServer, DiscoveredDevice};
pub use engine::DiscoveryEngine;
pub use error::DiscoveryError;
pub use lifecycle::ServiceState;
pub use ping::{PingReply, PingScanner, PingStatus};
