use async_trait::async_trait;
use dhcproto::v4::MessageType;
use lanwatch::{
    arp::ArpTableSource,
    dhcp::{ClientMessage, DhcpMessageProcessed},
    ping::{IcmpEcho, PingOptions, PingReply, PingStatus},
    ArpConfig, DhcpConfig, DiscoveryEngine, DiscoveryError, EngineConfig, MacAddress, PingConfig,
    ServiceState,
};
use std::{
    net::{Ipv4Addr, UdpSocket},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const ARP_TABLE: &str = "\
? (192.168.1.1) at 0a:1b:2c:3d:4e:5f [ether] on eth0
? (192.168.1.50) at 00:11:22:33:44:55 [ether] on eth0
";

/// Serves a fixed ARP table, counting how often it is asked.
struct FixedArpTable {
    output: &'static str,
    queries: AtomicUsize,
}

impl FixedArpTable {
    fn new(output: &'static str) -> Arc<Self> {
        Arc::new(Self {
            output,
            queries: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ArpTableSource for FixedArpTable {
    async fn query(&self, _timeout: Duration) -> Result<String, DiscoveryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.to_string())
    }
}

struct NoReplies;

#[async_trait]
impl IcmpEcho for NoReplies {
    async fn echo(
        &self,
        target: Ipv4Addr,
        _timeout: Duration,
        _payload: &[u8],
        _options: PingOptions,
    ) -> PingReply {
        PingReply::with_status(target, PingStatus::TimedOut)
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        dhcp: DhcpConfig {
            bind_address: Ipv4Addr::LOCALHOST,
            server_port: 0,
            ..DhcpConfig::default()
        },
        arp: ArpConfig {
            retry_delay: Duration::from_millis(1),
            process_exit_delay: Duration::ZERO,
            refresh_interval: None,
            ..ArpConfig::default()
        },
        ping: PingConfig {
            enable_logging: false,
            ..PingConfig::default()
        },
    }
}

fn client_mac() -> MacAddress {
    "00:11:22:33:44:55".parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_without_address_is_resolved_from_arp() {
    let arp_table = FixedArpTable::new(ARP_TABLE);
    let engine = DiscoveryEngine::with_parts(engine_config(), Arc::new(NoReplies), arp_table.clone());
    let mut devices = engine.subscribe_devices();

    let request = ClientMessage::new(MessageType::Request, client_mac(), 0x1234)
        .with_host_name("living-room-tv")
        .encode()
        .unwrap();
    let outcome = engine
        .dhcp()
        .processor()
        .handle_datagram(&request)
        .await
        .unwrap();
    assert_eq!(outcome, DhcpMessageProcessed::Success);

    let device = tokio::time::timeout(Duration::from_secs(5), devices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.physical_address, client_mac());
    assert_eq!(device.ip_address, Some(Ipv4Addr::new(192, 168, 1, 50)));
    assert_eq!(device.host_name.as_deref(), Some("living-room-tv"));
    assert_eq!(arp_table.queries.load(Ordering::SeqCst), 1);

    let session = engine.dhcp().sessions().snapshot().remove(0);
    assert_eq!(
        session.discovered_device().and_then(|device| device.ip_address),
        Some(Ipv4Addr::new(192, 168, 1, 50))
    );

    // The second lookup is served from the cache.
    let retry = ClientMessage::new(MessageType::Request, client_mac(), 0x5678)
        .encode()
        .unwrap();
    engine
        .dhcp()
        .processor()
        .handle_datagram(&retry)
        .await
        .unwrap();
    let device = devices.recv().await.unwrap();
    assert_eq!(device.ip_address, Some(Ipv4Addr::new(192, 168, 1, 50)));
    assert_eq!(arp_table.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_device_is_published_without_address() {
    let arp_table = FixedArpTable::new("");
    let engine = DiscoveryEngine::with_parts(engine_config(), Arc::new(NoReplies), arp_table.clone());
    let mut devices = engine.subscribe_devices();

    let request = ClientMessage::new(MessageType::Request, client_mac(), 9)
        .encode()
        .unwrap();
    engine
        .dhcp()
        .processor()
        .handle_datagram(&request)
        .await
        .unwrap();

    let device = devices.recv().await.unwrap();
    assert_eq!(device.ip_address, None);
    assert_eq!(arp_table.queries.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_engine_discovers_device_over_udp() {
    let arp_table = FixedArpTable::new(ARP_TABLE);
    let engine = DiscoveryEngine::with_parts(engine_config(), Arc::new(NoReplies), arp_table);
    let mut devices = engine.subscribe_devices();
    let mut states = engine.subscribe_state();

    engine.start().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ServiceState::Running);
    let listener = engine.dhcp().local_addr().unwrap();

    let requested = Ipv4Addr::new(192, 168, 1, 77);
    let request = ClientMessage::new(MessageType::Request, client_mac(), 42)
        .with_requested_address(requested)
        .with_vendor_class("MSFT 5.0")
        .encode()
        .unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(&request, listener).unwrap();

    let device = tokio::time::timeout(Duration::from_secs(5), devices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.ip_address, Some(requested));
    assert_eq!(device.device_type, lanwatch::DeviceType::Windows);
    assert_eq!(engine.dhcp().sessions().len(), 1);

    engine.stop().await.unwrap();
    assert_eq!(engine.state(), ServiceState::Stopped);
    assert_eq!(engine.dhcp().local_addr(), None);
}

#[tokio::test]
async fn test_engine_restarts_after_stop() {
    let engine = DiscoveryEngine::with_parts(
        engine_config(),
        Arc::new(NoReplies),
        FixedArpTable::new(ARP_TABLE),
    );

    for _ in 0..2 {
        engine.start().await.unwrap();
        assert_eq!(engine.arp().state(), ServiceState::Running);
        assert_eq!(engine.dhcp().state(), ServiceState::Running);
        engine.stop().await.unwrap();
        assert_eq!(engine.arp().state(), ServiceState::Stopped);
    }
    assert!(engine.stop().await.is_err());
}
