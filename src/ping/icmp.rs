use crate::network::new_icmp_socket;
use async_trait::async_trait;
use pnet::packet::{
    icmp::{
        self,
        echo_reply::EchoReplyPacket,
        echo_request::{EchoRequestPacket, MutableEchoRequestPacket},
        IcmpCode, IcmpPacket, IcmpTypes,
    },
    ipv4::Ipv4Packet,
    Packet,
};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::atomic::{AtomicU16, Ordering},
    time::{Duration, Instant},
};

/// Per-probe IP options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingOptions {
    pub ttl: u32,
    pub dont_fragment: bool,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            ttl: 64,
            dont_fragment: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    Success,
    TimedOut,
    DestinationUnreachable,
    TtlExpired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReply {
    pub address: Ipv4Addr,
    pub status: PingStatus,
    /// Only set for `Success`.
    pub round_trip: Option<Duration>,
}

impl PingReply {
    pub fn success(address: Ipv4Addr, round_trip: Duration) -> Self {
        Self {
            address,
            status: PingStatus::Success,
            round_trip: Some(round_trip),
        }
    }

    pub fn with_status(address: Ipv4Addr, status: PingStatus) -> Self {
        Self {
            address,
            status,
            round_trip: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PingStatus::Success
    }
}

/// Sends a single ICMP echo request and waits for its answer.
///
/// Implementations never fail outright; every problem is folded into the
/// returned `PingStatus`.
#[async_trait]
pub trait IcmpEcho: Send + Sync {
    async fn echo(
        &self,
        target: Ipv4Addr,
        timeout: Duration,
        payload: &[u8],
        options: PingOptions,
    ) -> PingReply;
}

/// `IcmpEcho` backed by an ICMP socket from [`new_icmp_socket`].
///
/// Each probe opens its own socket and runs on the blocking pool.
#[derive(Debug, Default)]
pub struct SocketPinger {
    sequence: AtomicU16,
}

impl SocketPinger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IcmpEcho for SocketPinger {
    async fn echo(
        &self,
        target: Ipv4Addr,
        timeout: Duration,
        payload: &[u8],
        options: PingOptions,
    ) -> PingReply {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let payload = payload.to_vec();

        let result = tokio::task::spawn_blocking(move || {
            echo_blocking(target, timeout, &payload, options, sequence)
        })
        .await;

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::debug!("ICMP echo to {} failed: {}", target, e);
                PingReply::with_status(target, PingStatus::Failed)
            }
            Err(e) => {
                tracing::warn!("ICMP echo task for {} aborted: {}", target, e);
                PingReply::with_status(target, PingStatus::Failed)
            }
        }
    }
}

fn echo_blocking(
    target: Ipv4Addr,
    timeout: Duration,
    payload: &[u8],
    options: PingOptions,
    sequence: u16,
) -> io::Result<PingReply> {
    let socket = new_icmp_socket(options.ttl, options.dont_fragment).map_err(io::Error::other)?;

    let identifier = (std::process::id() & 0xffff) as u16;
    let request = build_echo_request(identifier, sequence, payload)
        .ok_or_else(|| io::Error::other("echo request does not fit its buffer"))?;

    let started = Instant::now();
    socket.send_to(&request, SocketAddrV4::new(target, 0))?;

    let deadline = started + timeout;
    let mut buffer = [0u8; 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(PingReply::with_status(target, PingStatus::TimedOut));
        }
        socket.set_read_timeout(Some(remaining))?;

        let (len, from) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(PingReply::with_status(target, PingStatus::TimedOut));
            }
            Err(e) => return Err(e),
        };

        if let Some(status) = match_reply(&buffer[..len], from, target, sequence, payload) {
            return Ok(match status {
                PingStatus::Success => PingReply::success(target, started.elapsed()),
                other => PingReply::with_status(target, other),
            });
        }
    }
}

pub(crate) fn build_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; EchoRequestPacket::minimum_packet_size() + payload.len()];
    let mut request = MutableEchoRequestPacket::new(&mut buffer)?;
    request.set_icmp_type(IcmpTypes::EchoRequest);
    request.set_icmp_code(IcmpCode::new(0));
    request.set_identifier(identifier);
    request.set_sequence_number(sequence);
    request.set_payload(payload);

    let checksum = icmp::checksum(&IcmpPacket::new(request.to_immutable().packet())?);
    request.set_checksum(checksum);
    Some(buffer)
}

/// Raw sockets, and datagram sockets on some platforms, hand us the reply
/// with its IPv4 header still attached.
fn strip_ipv4_header(data: &[u8]) -> Option<&[u8]> {
    match Ipv4Packet::new(data) {
        Some(ip) if ip.get_version() == 4 => data.get(usize::from(ip.get_header_length()) * 4..),
        _ => Some(data),
    }
}

/// Decides whether `data` answers our probe. Raw sockets see every ICMP
/// packet on the host, so anything else returns `None` and is skipped.
pub(crate) fn match_reply(
    data: &[u8],
    from: SocketAddr,
    target: Ipv4Addr,
    sequence: u16,
    payload: &[u8],
) -> Option<PingStatus> {
    let data = strip_ipv4_header(data)?;
    let icmp_type = IcmpPacket::new(data)?.get_icmp_type();

    if icmp_type == IcmpTypes::EchoReply {
        let reply = EchoReplyPacket::new(data)?;
        let from_target = matches!(from, SocketAddr::V4(v4) if *v4.ip() == target);
        return (from_target
            && reply.get_sequence_number() == sequence
            && reply.payload().starts_with(payload))
        .then_some(PingStatus::Success);
    }

    let status = if icmp_type == IcmpTypes::DestinationUnreachable {
        PingStatus::DestinationUnreachable
    } else if icmp_type == IcmpTypes::TimeExceeded {
        PingStatus::TtlExpired
    } else {
        return None;
    };

    // The error quotes the IPv4 header of the probe that failed, after four
    // unused bytes.
    let error = IcmpPacket::new(data)?;
    let quoted = Ipv4Packet::new(error.payload().get(4..)?)?;
    (quoted.get_destination() == target).then_some(status)
}
