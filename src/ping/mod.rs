//! ICMP subnet scanner
//!
//! Probes are strictly serialized: a one-permit semaphore guarantees that at
//! most one echo request is outstanding per scanner, whether it came from a
//! sweep or from a single `ping_address` call. Every completed probe of a
//! sweep is dispatched to the registered reply handlers.

pub mod icmp;
pub mod job;

pub use icmp::{IcmpEcho, PingOptions, PingReply, PingStatus, SocketPinger};
pub use job::PingJob;

use crate::{
    addr::Ipv4Subnet,
    config::PingConfig,
    error::DiscoveryError,
    lifecycle::{Lifecycle, ServiceState, Worker},
};
use rand::seq::SliceRandom;
use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_PAYLOAD: &[u8] = b"abcdefghijklmnopqrstuvwxyz012345";

/// Delivered to reply handlers once per probed address.
#[derive(Debug, Clone)]
pub struct PingReplyEvent {
    pub job: PingJob,
    pub reply: PingReply,
    /// Cancelling this token stops the rest of the sweep.
    pub cancel: CancellationToken,
}

pub type PingReplyHandler = Arc<dyn Fn(&PingReplyEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub timeout: Duration,
    pub ping_options: PingOptions,
    pub address_limit: usize,
    /// Pause after each successful reply.
    pub wait_between_pings: Duration,
    pub shuffle: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            ping_options: PingOptions::default(),
            address_limit: usize::MAX,
            wait_between_pings: Duration::ZERO,
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub job_id: Uuid,
    pub probed: usize,
    pub replied: usize,
    pub cancelled: bool,
}

pub struct PingScanner {
    config: PingConfig,
    echo: Arc<dyn IcmpEcho>,
    in_flight: Semaphore,
    handlers: RwLock<Vec<PingReplyHandler>>,
    logging: AtomicBool,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    worker: Mutex<Option<Worker>>,
}

impl PingScanner {
    pub fn new(config: PingConfig) -> Self {
        Self::with_echo(config, Arc::new(SocketPinger::new()))
    }

    pub fn with_echo(config: PingConfig, echo: Arc<dyn IcmpEcho>) -> Self {
        let logging = AtomicBool::new(config.enable_logging);
        Self {
            config,
            echo,
            in_flight: Semaphore::new(1),
            handlers: RwLock::new(Vec::new()),
            logging,
            lifecycle: Lifecycle::new("ping"),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PingConfig {
        &self.config
    }

    pub fn on_ping_reply<F>(&self, handler: F)
    where
        F: Fn(&PingReplyEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Toggles the built-in per-reply log lines.
    pub fn set_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
    }

    /// Probes one address with the configured timeout and options.
    pub async fn ping_address(&self, address: Ipv4Addr) -> PingReply {
        self.probe(address, self.config.timeout, DEFAULT_PAYLOAD, self.config.options)
            .await
    }

    /// Sends one echo request once no other probe is outstanding.
    pub async fn probe(
        &self,
        address: Ipv4Addr,
        timeout: Duration,
        payload: &[u8],
        options: PingOptions,
    ) -> PingReply {
        let Ok(_permit) = self.in_flight.acquire().await else {
            return PingReply::with_status(address, PingStatus::Failed);
        };
        self.echo.echo(address, timeout, payload, options).await
    }

    /// Probes the host addresses of `subnet` one at a time.
    ///
    /// Stops early when `cancel` fires or a handler cancels the token in
    /// the event it receives. Handler-side cancellation does not propagate
    /// back to `cancel`.
    pub async fn ping_network(
        &self,
        subnet: &Ipv4Subnet,
        cancel: &CancellationToken,
        options: &ScanOptions,
    ) -> ScanSummary {
        let scan_cancel = cancel.child_token();
        let mut job = PingJob::new(*subnet);
        let mut summary = ScanSummary {
            job_id: job.job_id,
            probed: 0,
            replied: 0,
            cancelled: false,
        };

        let hosts = subnet.hosts();
        let targets: Box<dyn Iterator<Item = Ipv4Addr> + Send> = if options.shuffle {
            let mut shuffled: Vec<Ipv4Addr> = hosts.iter().collect();
            shuffled.shuffle(&mut rand::rng());
            Box::new(shuffled.into_iter())
        } else {
            Box::new(hosts.into_iter())
        };

        tracing::debug!(job_id = %job.job_id, "Sweeping {} ({} hosts)", subnet, hosts.len());

        for target in targets.take(options.address_limit) {
            if scan_cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            job.next_task(target);
            let reply = self
                .probe(target, options.timeout, &job.to_buffer(), options.ping_options)
                .await;
            summary.probed += 1;

            let success = reply.is_success();
            if success {
                summary.replied += 1;
            }

            self.dispatch(&PingReplyEvent {
                job: job.clone(),
                reply,
                cancel: scan_cancel.clone(),
            });

            if scan_cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            if success && !options.wait_between_pings.is_zero() {
                tokio::select! {
                    biased;
                    _ = scan_cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(options.wait_between_pings) => {}
                }
            }
        }

        if summary.cancelled {
            tracing::info!(job_id = %job.job_id, "Sweep of {} cancelled after {} probes", subnet, summary.probed);
        } else {
            tracing::debug!(
                job_id = %job.job_id,
                "Sweep of {} finished: {}/{} replied",
                subnet,
                summary.replied,
                summary.probed
            );
        }
        summary
    }

    fn dispatch(&self, event: &PingReplyEvent) {
        if self.logging.load(Ordering::Relaxed) {
            log_reply(event);
        }

        // Handlers may register further handlers; call them outside the lock.
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.lifecycle.subscribe()
    }

    /// Starts the background sweep of `config.sweep_subnet`, if any.
    pub fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        self.lifecycle.transition(ServiceState::Starting)?;

        if let Some(subnet) = self.config.sweep_subnet {
            let scanner = Arc::clone(self);
            let worker = Worker::spawn(&self.shutdown, move |cancel| async move {
                scanner.sweep_loop(subnet, cancel).await;
            });
            *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        }

        self.lifecycle.transition(ServiceState::Running)
    }

    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        self.lifecycle.transition(ServiceState::Stopping)?;
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
        self.lifecycle.transition(ServiceState::Stopped)
    }

    async fn sweep_loop(&self, subnet: Ipv4Subnet, cancel: CancellationToken) {
        let options = ScanOptions {
            timeout: self.config.timeout,
            ping_options: self.config.options,
            ..ScanOptions::default()
        };

        loop {
            self.ping_network(&subnet, &cancel, &options).await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
        }
    }
}

fn log_reply(event: &PingReplyEvent) {
    let job = &event.job;
    let reply = &event.reply;
    match reply.status {
        PingStatus::Success => tracing::info!(
            job_id = %job.job_id,
            task_id = job.task_id,
            timestamp = %job.timestamp,
            "Reply from {} in {:?}",
            reply.address,
            reply.round_trip.unwrap_or_default()
        ),
        PingStatus::TimedOut => tracing::trace!(
            job_id = %job.job_id,
            task_id = job.task_id,
            timestamp = %job.timestamp,
            "No reply from {}",
            reply.address
        ),
        status => tracing::debug!(
            job_id = %job.job_id,
            task_id = job.task_id,
            timestamp = %job.timestamp,
            "Ping {} failed: {:?}",
            reply.address,
            status
        ),
    }
}

#[cfg(test)]
mod tests;
