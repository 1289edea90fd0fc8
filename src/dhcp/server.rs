use super::{
    message::DhcpPacket,
    session::{DhcpMessageProcessed, DiscoveredDevice},
    store::SessionStore,
};
use crate::{
    addr::MacAddress,
    config::DhcpConfig,
    error::DiscoveryError,
    lifecycle::{loop_period, Lifecycle, ServiceState, Worker},
    network::new_dhcp_listener_socket,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dhcproto::v4::{MessageType, Opcode};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    net::UdpSocket,
    sync::{broadcast, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Receives devices identified by a successful DHCP request.
#[async_trait]
pub trait DeviceSink: Send + Sync {
    /// Returns the device as it was published, which may carry an address
    /// the request itself did not.
    async fn device_discovered(&self, device: DiscoveredDevice) -> DiscoveredDevice;
}

/// Published for every datagram that reached a session.
#[derive(Debug, Clone)]
pub struct DhcpMessageEvent {
    pub message_type: Option<MessageType>,
    pub session_id: u32,
    pub physical_address: MacAddress,
    pub outcome: DhcpMessageProcessed,
    pub timestamp: DateTime<Utc>,
}

/// Turns raw datagrams into session transitions. Cheap to clone; every
/// clone shares the same session store and event channel.
#[derive(Clone)]
pub struct DhcpProcessor {
    min_message_size: usize,
    max_message_size: usize,
    sessions: Arc<SessionStore>,
    events: broadcast::Sender<DhcpMessageEvent>,
    sink: Option<Arc<dyn DeviceSink>>,
}

impl DhcpProcessor {
    pub fn new(config: &DhcpConfig, sink: Option<Arc<dyn DeviceSink>>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            min_message_size: config.min_message_size,
            max_message_size: config.max_message_size,
            sessions: Arc::new(SessionStore::new(config.session_timeout)),
            events,
            sink,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhcpMessageEvent> {
        self.events.subscribe()
    }

    /// Applies one datagram to its client's session.
    ///
    /// Errors mean the datagram was not DHCP at all (wrong size or
    /// undecodable); every decodable message yields an outcome.
    pub async fn handle_datagram(&self, data: &[u8]) -> Result<DhcpMessageProcessed, DiscoveryError> {
        let packet = DhcpPacket::parse(data, self.min_message_size, self.max_message_size)?;

        match packet.opcode() {
            Opcode::BootRequest | Opcode::BootReply => {}
            other => {
                debug!(xid = packet.xid(), "Dropping datagram with opcode {:?}", other);
                return Ok(DhcpMessageProcessed::Unknown);
            }
        }

        let physical_address = packet.physical_address();
        if physical_address.is_none() {
            debug!(xid = packet.xid(), "Dropping datagram without a hardware address");
            return Ok(DhcpMessageProcessed::Failed);
        }

        let session = self.sessions.find_or_create(physical_address);
        let (outcome, device) = {
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = match packet.message_type() {
                Some(MessageType::Discover) => session.process_discover(&packet),
                Some(MessageType::Request) => session.process_request(&packet),
                Some(MessageType::Decline) => session.process_decline(&packet),
                Some(MessageType::Release) => session.process_release(&packet),
                Some(MessageType::Inform) => session.process_inform(&packet),
                Some(MessageType::Ack) => session.process_ack(&packet),
                _ => DhcpMessageProcessed::Unknown,
            };
            let device = match (outcome, packet.message_type()) {
                (DhcpMessageProcessed::Success, Some(MessageType::Request)) => {
                    session.discovered_device().cloned()
                }
                _ => None,
            };
            (outcome, device)
        };

        log_outcome(&packet, outcome);
        let _ = self.events.send(DhcpMessageEvent {
            message_type: packet.message_type(),
            session_id: packet.xid(),
            physical_address,
            outcome,
            timestamp: Utc::now(),
        });

        if let (Some(device), Some(sink)) = (device, &self.sink) {
            let published = sink.device_discovered(device).await;
            if let Some(ip_address) = published.ip_address {
                session
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .backfill_ip_address(ip_address);
            }
        }

        Ok(outcome)
    }
}

fn log_outcome(packet: &DhcpPacket, outcome: DhcpMessageProcessed) {
    let mac = packet.physical_address();
    let kind = packet.message_type();
    let xid = packet.xid();
    match outcome {
        DhcpMessageProcessed::Success => {
            info!(mac = %mac, xid, "DHCP {:?} processed: {}", kind, outcome)
        }
        DhcpMessageProcessed::Duplicate => {
            trace!(mac = %mac, xid, "DHCP {:?} processed: {}", kind, outcome)
        }
        DhcpMessageProcessed::Ignored
        | DhcpMessageProcessed::Failed
        | DhcpMessageProcessed::Unknown => {
            debug!(mac = %mac, xid, "DHCP {:?} processed: {}", kind, outcome)
        }
    }
}

/// Passive DHCP listener that tracks client sessions.
pub struct DhcpServer {
    config: DhcpConfig,
    processor: DhcpProcessor,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    workers: Mutex<Vec<Worker>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DhcpServer {
    pub fn new(config: DhcpConfig, sink: Option<Arc<dyn DeviceSink>>) -> Self {
        let processor = DhcpProcessor::new(&config, sink);
        Self {
            config,
            processor,
            lifecycle: Lifecycle::new("dhcp"),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }
    }

    pub fn processor(&self) -> &DhcpProcessor {
        &self.processor
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.processor.sessions()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhcpMessageEvent> {
        self.processor.subscribe()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.lifecycle.subscribe()
    }

    /// Binds the listener and starts the receive and reaper loops.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        self.lifecycle.transition(ServiceState::Starting)?;

        let socket = match new_dhcp_listener_socket(
            self.config.bind_address,
            self.config.server_port,
            self.config.interface.as_deref(),
        ) {
            Ok(socket) => socket,
            Err(e) => {
                self.lifecycle.transition(ServiceState::Stopped)?;
                return Err(e.into());
            }
        };
        let local_addr = socket.local_addr().ok();
        info!("DHCP listener bound to {:?}", local_addr);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = local_addr;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let processor = self.processor.clone();
        let buffer_size = self.config.receive_buffer_size;
        workers.push(Worker::spawn(&self.shutdown, move |cancel| {
            receive_loop(socket, processor, buffer_size, cancel)
        }));

        if let Some(period) = loop_period(self.config.session_reap_interval) {
            let sessions = Arc::clone(self.processor.sessions());
            workers.push(Worker::spawn(&self.shutdown, move |cancel| {
                reap_loop(sessions, period, cancel)
            }));
        }
        drop(workers);

        self.lifecycle.transition(ServiceState::Running)
    }

    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        self.lifecycle.transition(ServiceState::Stopping)?;
        let workers: Vec<Worker> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            worker.shutdown().await;
        }
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.lifecycle.transition(ServiceState::Stopped)
    }
}

async fn receive_loop(
    socket: UdpSocket,
    processor: DhcpProcessor,
    buffer_size: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("DHCP listener shutting down");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        let datagram = buf[..len].to_vec();
                        let processor = processor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = processor.handle_datagram(&datagram).await {
                                debug!(%peer, "Dropped datagram: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Error receiving DHCP datagram: {}", e),
                }
            }
        }
    }
}

async fn reap_loop(sessions: Arc<SessionStore>, period: std::time::Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let reaped = sessions.reap_expired(Utc::now());
                if reaped > 0 {
                    debug!("Reaped {} expired DHCP sessions, {} remain", reaped, sessions.len());
                }
            }
        }
    }
}
