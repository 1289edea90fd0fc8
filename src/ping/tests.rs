use super::icmp::{build_echo_request, match_reply};
use super::*;
use async_trait::async_trait;
use pnet::packet::{
    icmp::{
        self,
        echo_reply::{EchoReplyPacket, MutableEchoReplyPacket},
        echo_request::EchoRequestPacket,
        IcmpCode, IcmpPacket, IcmpType, IcmpTypes, MutableIcmpPacket,
    },
    ipv4::MutableIpv4Packet,
    Packet,
};
use std::{
    collections::HashSet,
    net::{SocketAddr, SocketAddrV4},
    sync::atomic::AtomicUsize,
};

/// Answers for a fixed set of live hosts and records what was probed.
#[derive(Default)]
struct FakeEcho {
    live: HashSet<Ipv4Addr>,
    probed: Mutex<Vec<Ipv4Addr>>,
    payloads: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEcho {
    fn with_live(live: &[Ipv4Addr]) -> Self {
        Self {
            live: live.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn probed(&self) -> Vec<Ipv4Addr> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl IcmpEcho for FakeEcho {
    async fn echo(
        &self,
        target: Ipv4Addr,
        _timeout: Duration,
        payload: &[u8],
        _options: PingOptions,
    ) -> PingReply {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.probed.lock().unwrap().push(target);
        self.payloads.lock().unwrap().push(payload.to_vec());
        if self.live.contains(&target) {
            PingReply::success(target, Duration::from_millis(1))
        } else {
            PingReply::with_status(target, PingStatus::TimedOut)
        }
    }
}

fn scanner_with(echo: Arc<FakeEcho>) -> Arc<PingScanner> {
    let config = PingConfig {
        enable_logging: false,
        ..PingConfig::default()
    };
    Arc::new(PingScanner::with_echo(config, echo))
}

fn subnet(text: &str) -> Ipv4Subnet {
    text.parse().unwrap()
}

#[tokio::test]
async fn test_sweep_pings_every_host_once() {
    let echo = Arc::new(FakeEcho::with_live(&[Ipv4Addr::new(192, 168, 7, 10)]));
    let scanner = scanner_with(echo.clone());

    let summary = scanner
        .ping_network(
            &subnet("192.168.7.0/28"),
            &CancellationToken::new(),
            &ScanOptions::default(),
        )
        .await;

    assert_eq!(summary.probed, 14);
    assert_eq!(summary.replied, 1);
    assert!(!summary.cancelled);

    let mut probed = echo.probed();
    probed.sort();
    let expected: Vec<Ipv4Addr> = (1..=14).map(|i| Ipv4Addr::new(192, 168, 7, i)).collect();
    assert_eq!(probed, expected);
}

#[tokio::test]
async fn test_address_limit_caps_pings() {
    let echo = Arc::new(FakeEcho::default());
    let scanner = scanner_with(echo.clone());
    let options = ScanOptions {
        address_limit: 5,
        ..ScanOptions::default()
    };

    let summary = scanner
        .ping_network(&subnet("10.0.0.0/24"), &CancellationToken::new(), &options)
        .await;

    assert_eq!(summary.probed, 5);
    assert_eq!(echo.probed().len(), 5);
}

#[tokio::test]
async fn test_unshuffled_sweep_runs_in_order() {
    let echo = Arc::new(FakeEcho::default());
    let scanner = scanner_with(echo.clone());
    let options = ScanOptions {
        shuffle: false,
        address_limit: 3,
        ..ScanOptions::default()
    };

    scanner
        .ping_network(&subnet("10.0.0.0/24"), &CancellationToken::new(), &options)
        .await;

    assert_eq!(
        echo.probed(),
        vec![
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3)
        ]
    );
}

#[tokio::test]
async fn test_handler_cancellation_stops_sweep() {
    let echo = Arc::new(FakeEcho::default());
    let scanner = scanner_with(echo.clone());
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = seen.clone();
    scanner.on_ping_reply(move |event| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            event.cancel.cancel();
        }
    });

    let outer = CancellationToken::new();
    let summary = scanner
        .ping_network(&subnet("10.0.0.0/24"), &outer, &ScanOptions::default())
        .await;

    assert!(summary.cancelled);
    assert_eq!(summary.probed, 3);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert!(!outer.is_cancelled());
}

#[tokio::test]
async fn test_pre_cancelled_sweep_pings_nothing() {
    let echo = Arc::new(FakeEcho::default());
    let scanner = scanner_with(echo.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = scanner
        .ping_network(&subnet("10.0.0.0/24"), &cancel, &ScanOptions::default())
        .await;

    assert!(summary.cancelled);
    assert_eq!(summary.probed, 0);
}

#[tokio::test]
async fn test_events_carry_job_and_task_ids() {
    let echo = Arc::new(FakeEcho::default());
    let scanner = scanner_with(echo.clone());
    let events = Arc::new(Mutex::new(Vec::new()));

    let sink = events.clone();
    scanner.on_ping_reply(move |event| sink.lock().unwrap().push(event.job.clone()));

    let summary = scanner
        .ping_network(
            &subnet("10.0.0.0/29"),
            &CancellationToken::new(),
            &ScanOptions::default(),
        )
        .await;

    let jobs = events.lock().unwrap().clone();
    assert_eq!(jobs.len(), 6);
    for (index, job) in jobs.iter().enumerate() {
        assert_eq!(job.job_id, summary.job_id);
        assert_eq!(job.task_id, index as u64 + 1);
    }

    // The probe payload identifies the job that sent it.
    let payloads = echo.payloads.lock().unwrap().clone();
    let decoded = PingJob::from_buffer(&payloads[0]).unwrap();
    assert_eq!(decoded.job_id, summary.job_id);
    assert_eq!(decoded.task_id, 1);
    assert_eq!(decoded.subnet, subnet("10.0.0.0/29"));
}

#[tokio::test]
async fn test_pings_never_overlap() {
    let echo = Arc::new(FakeEcho::default());
    let scanner = scanner_with(echo.clone());

    let sweeps = (0..3).map(|_| {
        let scanner = scanner.clone();
        tokio::spawn(async move {
            scanner
                .ping_network(
                    &"10.0.0.0/29".parse().unwrap(),
                    &CancellationToken::new(),
                    &ScanOptions::default(),
                )
                .await
        })
    });
    let single = {
        let scanner = scanner.clone();
        tokio::spawn(async move { scanner.ping_address(Ipv4Addr::new(10, 0, 0, 1)).await })
    };

    for sweep in sweeps.collect::<Vec<_>>() {
        sweep.await.unwrap();
    }
    single.await.unwrap();

    assert_eq!(echo.probed().len(), 19);
    assert_eq!(echo.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_waits_only_after_success() {
    let live = Ipv4Addr::new(10, 0, 0, 1);
    let echo = Arc::new(FakeEcho::with_live(&[live]));
    let scanner = scanner_with(echo.clone());
    let options = ScanOptions {
        shuffle: false,
        address_limit: 4,
        wait_between_pings: Duration::from_secs(60),
        ..ScanOptions::default()
    };

    let started = tokio::time::Instant::now();
    let summary = scanner
        .ping_network(&subnet("10.0.0.0/24"), &CancellationToken::new(), &options)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(summary.replied, 1);
    assert!(elapsed >= Duration::from_secs(60));
    assert!(elapsed < Duration::from_secs(120));
}

#[tokio::test]
async fn test_start_and_stop_without_sweep() {
    let scanner = scanner_with(Arc::new(FakeEcho::default()));
    scanner.start().unwrap();
    assert_eq!(scanner.state(), ServiceState::Running);
    assert!(scanner.start().is_err());
    scanner.stop().await.unwrap();
    assert_eq!(scanner.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_background_sweep_runs_until_stopped() {
    let echo = Arc::new(FakeEcho::default());
    let config = PingConfig {
        enable_logging: false,
        sweep_subnet: Some(subnet("10.9.0.0/30")),
        sweep_interval: Duration::from_millis(10),
        ..PingConfig::default()
    };
    let scanner = Arc::new(PingScanner::with_echo(config, echo.clone()));

    scanner.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    scanner.stop().await.unwrap();

    let after_stop = echo.probed().len();
    assert!(after_stop >= 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(echo.probed().len(), after_stop);
}

#[test]
fn test_ping_job_buffer() {
    let mut job = PingJob::new(subnet("172.16.4.0/22"));
    job.next_task(Ipv4Addr::new(172, 16, 5, 9));

    let buffer = job.to_buffer();
    assert_eq!(buffer.len(), PingJob::ENCODED_LEN);

    let decoded = PingJob::from_buffer(&buffer).unwrap();
    assert_eq!(decoded.job_id, job.job_id);
    assert_eq!(decoded.task_id, 1);
    assert_eq!(decoded.target, Ipv4Addr::new(172, 16, 5, 9));
    assert_eq!(decoded.subnet.prefix_len(), 22);
    assert_eq!(
        decoded.timestamp.timestamp_millis(),
        job.timestamp.timestamp_millis()
    );

    assert!(PingJob::from_buffer(&buffer[..10]).is_none());
}

fn echo_reply(sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; EchoReplyPacket::minimum_packet_size() + payload.len()];
    let mut reply = MutableEchoReplyPacket::new(&mut buffer).unwrap();
    reply.set_icmp_type(IcmpTypes::EchoReply);
    reply.set_identifier(0x1234);
    reply.set_sequence_number(sequence);
    reply.set_payload(payload);
    buffer
}

/// An ICMP error of `kind` quoting a probe sent to `destination`.
fn icmp_error(kind: IcmpType, destination: Ipv4Addr) -> Vec<u8> {
    let mut quoted = [0u8; 28];
    let mut header = MutableIpv4Packet::new(&mut quoted).unwrap();
    header.set_version(4);
    header.set_header_length(5);
    header.set_total_length(28);
    header.set_destination(destination);

    let mut rest = vec![0u8; 4];
    rest.extend_from_slice(&quoted);
    let mut buffer = vec![0u8; IcmpPacket::minimum_packet_size() + rest.len()];
    let mut error = MutableIcmpPacket::new(&mut buffer).unwrap();
    error.set_icmp_type(kind);
    error.set_icmp_code(IcmpCode::new(1));
    error.set_payload(&rest);
    buffer
}

#[test]
fn test_echo_request_layout_and_checksum() {
    let request = build_echo_request(1, 1, b"").unwrap();
    assert_eq!(request, [8, 0, 0xf7, 0xfd, 0, 1, 0, 1]);

    let request = build_echo_request(0xbeef, 42, DEFAULT_PAYLOAD).unwrap();
    let parsed = EchoRequestPacket::new(&request).unwrap();
    assert_eq!(parsed.get_identifier(), 0xbeef);
    assert_eq!(parsed.get_sequence_number(), 42);
    assert_eq!(parsed.payload(), DEFAULT_PAYLOAD);
    assert_eq!(
        parsed.get_checksum(),
        icmp::checksum(&IcmpPacket::new(&request).unwrap())
    );
}

#[test]
fn test_match_reply_with_and_without_ip_header() {
    let target = Ipv4Addr::new(192, 168, 1, 20);
    let from = SocketAddr::V4(SocketAddrV4::new(target, 0));
    let reply = echo_reply(7, b"hi");

    assert_eq!(
        match_reply(&reply, from, target, 7, b"hi"),
        Some(PingStatus::Success)
    );
    assert_eq!(match_reply(&reply, from, target, 8, b"hi"), None);
    assert_eq!(match_reply(&reply, from, target, 7, b"ho"), None);

    let mut with_header = vec![0x45u8];
    with_header.extend_from_slice(&[0; 19]);
    with_header.extend_from_slice(&reply);
    assert_eq!(
        match_reply(&with_header, from, target, 7, b"hi"),
        Some(PingStatus::Success)
    );

    let elsewhere = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 21), 0));
    assert_eq!(match_reply(&reply, elsewhere, target, 7, b"hi"), None);
}

#[test]
fn test_match_reply_unreachable() {
    let target = Ipv4Addr::new(10, 1, 1, 1);
    let router = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 0, 1), 0));

    assert_eq!(
        match_reply(
            &icmp_error(IcmpTypes::DestinationUnreachable, target),
            router,
            target,
            1,
            b""
        ),
        Some(PingStatus::DestinationUnreachable)
    );
    assert_eq!(
        match_reply(&icmp_error(IcmpTypes::TimeExceeded, target), router, target, 1, b""),
        Some(PingStatus::TtlExpired)
    );

    // Someone else's probe failing is not our answer.
    let other = Ipv4Addr::new(10, 1, 1, 2);
    assert_eq!(
        match_reply(&icmp_error(IcmpTypes::TimeExceeded, other), router, target, 1, b""),
        None
    );
    assert_eq!(
        match_reply(&build_echo_request(1, 1, b"").unwrap(), router, target, 1, b""),
        None
    );
}
