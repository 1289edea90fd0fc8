//! Discovery coordinator
//!
//! Owns the ARP service, the ping scanner and the DHCP listener, and turns
//! successful DHCP requests into published `DiscoveredDevice` events. A
//! device whose request carried no address is resolved through the ARP
//! cache first.

use crate::{
    arp::{ArpService, ArpTableSource},
    config::EngineConfig,
    dhcp::{DeviceSink, DhcpMessageEvent, DhcpServer, DiscoveredDevice},
    error::DiscoveryError,
    events::Publisher,
    lifecycle::{Lifecycle, ServiceState},
    ping::{IcmpEcho, PingScanner},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Back-fills missing addresses from ARP, then publishes the device.
pub struct DeviceResolver {
    arp: Arc<ArpService>,
    devices: Arc<Publisher<DiscoveredDevice>>,
}

impl DeviceResolver {
    pub fn new(arp: Arc<ArpService>, devices: Arc<Publisher<DiscoveredDevice>>) -> Self {
        Self { arp, devices }
    }

    async fn resolve(&self, mut device: DiscoveredDevice) -> DiscoveredDevice {
        if device.ip_address.is_some() || device.physical_address.is_none() {
            return device;
        }

        let arp = Arc::clone(&self.arp);
        let physical_address = device.physical_address;
        match tokio::task::spawn_blocking(move || arp.get_ip_address(physical_address, true)).await
        {
            Ok(ip_address) => {
                tracing::debug!(
                    mac = %physical_address,
                    "ARP back-fill resolved {:?}",
                    ip_address
                );
                device.ip_address = ip_address;
            }
            Err(e) => tracing::warn!(mac = %physical_address, "ARP back-fill aborted: {}", e),
        }
        device
    }
}

#[async_trait]
impl DeviceSink for DeviceResolver {
    async fn device_discovered(&self, device: DiscoveredDevice) -> DiscoveredDevice {
        let device = self.resolve(device).await;
        tracing::info!(
            mac = %device.physical_address,
            ip = ?device.ip_address,
            device_type = ?device.device_type,
            "Device discovered"
        );
        self.devices.publish(device.clone());
        device
    }
}

pub struct DiscoveryEngine {
    ping: Arc<PingScanner>,
    arp: Arc<ArpService>,
    dhcp: DhcpServer,
    devices: Arc<Publisher<DiscoveredDevice>>,
    lifecycle: Lifecycle,
}

impl DiscoveryEngine {
    /// Builds an engine on the system ARP command and ICMP sockets.
    pub fn new(config: EngineConfig) -> Result<Self, DiscoveryError> {
        let ping = Arc::new(PingScanner::new(config.ping));
        let arp = Arc::new(ArpService::new(config.arp, Arc::clone(&ping))?);
        Ok(Self::assemble(config.dhcp, ping, arp))
    }

    /// Builds an engine on caller-supplied ICMP and ARP table facilities.
    pub fn with_parts(
        config: EngineConfig,
        echo: Arc<dyn IcmpEcho>,
        arp_source: Arc<dyn ArpTableSource>,
    ) -> Self {
        let ping = Arc::new(PingScanner::with_echo(config.ping, echo));
        let arp = Arc::new(ArpService::with_source(
            config.arp,
            arp_source,
            Arc::clone(&ping),
        ));
        Self::assemble(config.dhcp, ping, arp)
    }

    fn assemble(
        dhcp_config: crate::config::DhcpConfig,
        ping: Arc<PingScanner>,
        arp: Arc<ArpService>,
    ) -> Self {
        let devices = Arc::new(Publisher::new());
        let resolver: Arc<dyn DeviceSink> =
            Arc::new(DeviceResolver::new(Arc::clone(&arp), Arc::clone(&devices)));
        let dhcp = DhcpServer::new(dhcp_config, Some(resolver));
        Self {
            ping,
            arp,
            dhcp,
            devices,
            lifecycle: Lifecycle::new("engine"),
        }
    }

    pub fn ping(&self) -> &Arc<PingScanner> {
        &self.ping
    }

    pub fn arp(&self) -> &Arc<ArpService> {
        &self.arp
    }

    pub fn dhcp(&self) -> &DhcpServer {
        &self.dhcp
    }

    pub fn subscribe_devices(&self) -> mpsc::UnboundedReceiver<DiscoveredDevice> {
        self.devices.subscribe()
    }

    pub fn subscribe_dhcp(&self) -> broadcast::Receiver<DhcpMessageEvent> {
        self.dhcp.subscribe()
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.lifecycle.subscribe()
    }

    /// Starts ARP, then ping, then DHCP. If any fails, the ones already
    /// running are stopped again.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        self.lifecycle.transition(ServiceState::Starting)?;

        if let Err(e) = self.arp.start() {
            self.lifecycle.transition(ServiceState::Stopped)?;
            return Err(e);
        }
        if let Err(e) = self.ping.start() {
            log_stop("arp", self.arp.stop().await);
            self.lifecycle.transition(ServiceState::Stopped)?;
            return Err(e);
        }
        if let Err(e) = self.dhcp.start() {
            log_stop("ping", self.ping.stop().await);
            log_stop("arp", self.arp.stop().await);
            self.lifecycle.transition(ServiceState::Stopped)?;
            return Err(e);
        }

        tracing::info!("Discovery engine running");
        self.lifecycle.transition(ServiceState::Running)
    }

    /// Stops DHCP, then ping, then ARP.
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        self.lifecycle.transition(ServiceState::Stopping)?;
        log_stop("dhcp", self.dhcp.stop().await);
        log_stop("ping", self.ping.stop().await);
        log_stop("arp", self.arp.stop().await);
        tracing::info!("Discovery engine stopped");
        self.lifecycle.transition(ServiceState::Stopped)
    }
}

fn log_stop(service: &str, result: Result<(), DiscoveryError>) {
    if let Err(e) = result {
        tracing::warn!("Failed to stop {}: {}", service, e);
    }
}
