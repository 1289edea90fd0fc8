//! Passive DHCPv4 session tracking
//!
//! This module listens to client lease negotiations and includes:
//! - Datagram decoding into `DhcpPacket`
//! - The per-client session state machine
//! - The session store with expiry-based reaping
//! - The UDP listener that dispatches one task per datagram

pub mod message;
pub mod server;
pub mod session;
pub mod store;

pub use message::{ClientMessage, DhcpPacket};
pub use server::{DeviceSink, DhcpMessageEvent, DhcpProcessor, DhcpServer};
pub use session::{
    DeviceType, DhcpMessageProcessed, DhcpSession, DhcpSessionResult, DhcpSessionState,
    DiscoveredDevice, RequestState,
};
pub use store::{SessionStore, SharedSession};
