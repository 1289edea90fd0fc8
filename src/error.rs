use crate::{lifecycle::ServiceState, network::SocketError};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Socket operation failed")]
    Socket(#[from] SocketError),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("Malformed DHCP datagram: {0}")]
    Protocol(String),

    #[error("Failed to parse MAC address: {0}")]
    MacParse(String),

    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("ARP command '{}' exited unsuccessfully: {stderr}", .path.display())]
    ArpCommandFailed { path: PathBuf, stderr: String },

    #[error("ARP command timed out after {0:?}")]
    ArpCommandTimeout(Duration),

    #[error("No ARP command found on this system")]
    ArpCommandNotFound,

    #[error("Cannot move {service} from {from:?} to {to:?}")]
    Lifecycle {
        service: &'static str,
        from: ServiceState,
        to: ServiceState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DiscoveryError::MacParse("zz:zz".to_string());
        assert_eq!(err.to_string(), "Failed to parse MAC address: zz:zz");

        let err = DiscoveryError::ArpCommandFailed {
            path: PathBuf::from("/usr/sbin/arp"),
            stderr: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ARP command '/usr/sbin/arp' exited unsuccessfully: permission denied"
        );

        let err = DiscoveryError::Lifecycle {
            service: "dhcp",
            from: ServiceState::Running,
            to: ServiceState::Starting,
        };
        assert_eq!(err.to_string(), "Cannot move dhcp from Running to Starting");
    }
}
