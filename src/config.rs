use crate::{addr::Ipv4Subnet, ping::PingOptions};
use clap::Parser;
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

pub const DHCP_SERVER_PORT: u16 = 67;
/// Smallest datagram that can hold the fixed BOOTP header.
pub const DHCP_MIN_MESSAGE_SIZE: usize = 236;
pub const DHCP_MAX_MESSAGE_SIZE: usize = 1024;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Network interface the DHCP listener is pinned to (e.g., 'eth0')
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Subnet to sweep with ICMP, e.g. '192.168.1.0/24'
    #[arg(short, long)]
    pub subnet: Option<Ipv4Subnet>,

    /// Seconds between ICMP sweeps of the subnet
    #[arg(long, default_value_t = 600)]
    pub sweep_interval: u64,

    /// Seconds between full ARP cache refreshes (0 = only on demand)
    #[arg(long, default_value_t = 180)]
    pub arp_refresh_interval: u64,

    /// UDP port the DHCP listener binds to
    #[arg(short, long, default_value_t = DHCP_SERVER_PORT)]
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DhcpConfig {
    pub bind_address: Ipv4Addr,
    pub server_port: u16,
    pub interface: Option<String>,
    pub min_message_size: usize,
    pub max_message_size: usize,
    pub receive_buffer_size: usize,
    pub session_timeout: Duration,
    /// How often expired sessions are swept; `None` keeps sessions forever.
    pub session_reap_interval: Option<Duration>,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            server_port: DHCP_SERVER_PORT,
            interface: None,
            min_message_size: DHCP_MIN_MESSAGE_SIZE,
            max_message_size: DHCP_MAX_MESSAGE_SIZE,
            receive_buffer_size: 1500,
            session_timeout: Duration::from_secs(10 * 60),
            session_reap_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArpConfig {
    /// Explicit path to the ARP tool; located on the system when unset.
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub command_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Pause after the command exits before its output is parsed.
    pub process_exit_delay: Duration,
    /// Periodic full refresh; `None` refreshes only on start and on demand.
    pub refresh_interval: Option<Duration>,
    /// Upper bound for a blocking IP lookup that has to refresh the cache.
    pub lookup_timeout: Duration,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["-a".to_string()],
            command_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            process_exit_delay: Duration::from_millis(100),
            refresh_interval: Some(Duration::from_secs(180)),
            lookup_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PingConfig {
    pub timeout: Duration,
    pub options: PingOptions,
    pub enable_logging: bool,
    /// Subnet swept in the background while the service runs.
    pub sweep_subnet: Option<Ipv4Subnet>,
    pub sweep_interval: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            options: PingOptions::default(),
            enable_logging: true,
            sweep_subnet: None,
            sweep_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub dhcp: DhcpConfig,
    pub arp: ArpConfig,
    pub ping: PingConfig,
}

impl EngineConfig {
    pub fn from_args(args: &Args) -> Self {
        let mut config = Self::default();
        config.dhcp.interface = args.interface.clone();
        config.dhcp.server_port = args.port;
        config.ping.sweep_subnet = args.subnet;
        config.ping.sweep_interval = Duration::from_secs(args.sweep_interval.max(1));
        config.arp.refresh_interval = match args.arp_refresh_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        config
    }
}
