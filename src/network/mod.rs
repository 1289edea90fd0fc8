use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket},
};
use thiserror::Error;
use tokio::net::UdpSocket as TokioUdpSocket;

/// Defines all possible errors for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to enable broadcast on socket")]
    SetBroadcast(#[source] io::Error),

    #[error("Failed to set SO_BINDTODEVICE on interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind socket to {addr}")]
    BindSocket {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to set SO_REUSEADDR on socket")]
    SetReuseAddress(#[source] io::Error),

    #[error("Failed to set IP option '{option}'")]
    SetIpOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to set socket to non-blocking mode")]
    SetNonBlocking(#[source] io::Error),

    #[error("Failed to convert socket to TokioUdpSocket")]
    ConvertToTokio(#[source] io::Error),

    #[allow(dead_code)]
    #[error("Binding to a specific device is not implemented on this platform")]
    NotImplemented,
}

/// Creates the listening socket for the DHCP server port.
///
/// The socket is bound to `bind_addr:port` with `SO_BROADCAST` and
/// `SO_REUSEADDR` set, so it coexists with a real DHCP server on the same
/// host. When `interface` is given the socket is also pinned to that device.
pub fn new_dhcp_listener_socket(
    bind_addr: Ipv4Addr,
    port: u16,
    interface: Option<&str>,
) -> Result<TokioUdpSocket, SocketError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(SocketError::CreateSocket)?;

    socket2
        .set_broadcast(true)
        .map_err(SocketError::SetBroadcast)?;

    socket2
        .set_reuse_address(true)
        .map_err(SocketError::SetReuseAddress)?;

    if let Some(interface) = interface {
        bind_to_device(&socket2, interface)?;
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(bind_addr, port));
    socket2
        .bind(&addr.into())
        .map_err(|source| SocketError::BindSocket { addr, source })?;

    let std_socket: StdUdpSocket = socket2.into();
    std_socket
        .set_nonblocking(true)
        .map_err(SocketError::SetNonBlocking)?;
    TokioUdpSocket::from_std(std_socket).map_err(SocketError::ConvertToTokio)
}

/// Creates a blocking ICMPv4 socket for echo requests.
///
/// An unprivileged datagram ICMP socket is tried first; if the platform
/// refuses it, a raw socket is used instead (requires elevated rights).
/// Replies on a raw socket, and on some platforms a datagram socket too,
/// arrive with their IPv4 header still attached.
pub fn new_icmp_socket(ttl: u32, dont_fragment: bool) -> Result<StdUdpSocket, SocketError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
        .or_else(|_| Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)))
        .map_err(SocketError::CreateSocket)?;

    socket2
        .set_ttl(ttl)
        .map_err(|source| SocketError::SetIpOption {
            option: "IP_TTL",
            source,
        })?;

    if dont_fragment {
        set_dont_fragment(&socket2)?;
    }

    Ok(socket2.into())
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &socket2::Socket, interface: &str) -> Result<(), SocketError> {
    use std::os::fd::AsRawFd;

    // Set `SO_BINDTODEVICE`. This is an unsafe raw syscall.
    // It is safe here because we use a valid file descriptor and correct parameters.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::BindToDevice {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Fallback for non-Linux systems where `SO_BINDTODEVICE` is not available.
#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &socket2::Socket, _interface: &str) -> Result<(), SocketError> {
    Err(SocketError::NotImplemented)
}

#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &socket2::Socket) -> Result<(), SocketError> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = libc::IP_PMTUDISC_DO;
    // Same reasoning as SO_BINDTODEVICE: valid fd, value outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::SetIpOption {
            option: "IP_MTU_DISCOVER",
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_socket: &socket2::Socket) -> Result<(), SocketError> {
    tracing::trace!("don't-fragment is not settable on this platform, sending without it");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_binds_ephemeral_port() {
        let socket = new_dhcp_listener_socket(Ipv4Addr::LOCALHOST, 0, None).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);

        let client = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
    }

    #[test]
    fn test_socket_error_display() {
        let err = SocketError::BindToDevice {
            interface: "eth9".to_string(),
            source: io::Error::other("no such device"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to set SO_BINDTODEVICE on interface 'eth9'"
        );
    }
}
