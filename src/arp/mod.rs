//! ARP cache refresher
//!
//! Polls the operating system's ARP table through an external command and
//! keeps a bidirectional IP ↔ MAC cache of the result. Lookups that miss the
//! cache can trigger a refresh, optionally preceded by an ICMP probe so the
//! kernel has a reason to resolve the address first.

pub mod cache;
pub mod command;
pub mod parse;

pub use cache::{ArpCache, ArpItem};
pub use command::{ArpCommand, ArpTableSource};
pub use parse::parse_arp_line;

use crate::{
    addr::MacAddress,
    config::ArpConfig,
    error::DiscoveryError,
    lifecycle::{loop_period, Lifecycle, ServiceState, Worker},
    ping::PingScanner,
};
use chrono::{DateTime, Utc};
use std::{
    future::Future,
    net::Ipv4Addr,
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpRefreshStatus {
    NotStarted,
    /// The ARP command is running (or being retried).
    Running,
    /// Command output received and being applied to the cache.
    Processed,
    Completed,
    /// Every attempt to run the command failed.
    Failed,
    Cancelled,
}

struct RefreshRecord {
    status: ArpRefreshStatus,
    updated: Option<DateTime<Utc>>,
}

pub struct ArpService {
    config: ArpConfig,
    source: Arc<dyn ArpTableSource>,
    scanner: Arc<PingScanner>,
    cache: ArpCache,
    record: Mutex<RefreshRecord>,
    // Serializes refreshes; a tokio mutex so it also works from the
    // dedicated runtime used by blocking lookups.
    refreshing: tokio::sync::Mutex<()>,
    lifecycle: Lifecycle,
    shutdown: CancellationToken,
    worker: Mutex<Option<Worker>>,
}

impl ArpService {
    /// Creates a service that runs the system ARP command.
    pub fn new(config: ArpConfig, scanner: Arc<PingScanner>) -> Result<Self, DiscoveryError> {
        let command = ArpCommand::locate(&config)?;
        tracing::info!(
            "ARP table source: {} {}",
            command.path().display(),
            command.args().join(" ")
        );
        Ok(Self::with_source(config, Arc::new(command), scanner))
    }

    pub fn with_source(
        config: ArpConfig,
        source: Arc<dyn ArpTableSource>,
        scanner: Arc<PingScanner>,
    ) -> Self {
        Self {
            config,
            source,
            scanner,
            cache: ArpCache::new(),
            record: Mutex::new(RefreshRecord {
                status: ArpRefreshStatus::NotStarted,
                updated: None,
            }),
            refreshing: tokio::sync::Mutex::new(()),
            lifecycle: Lifecycle::new("arp"),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    fn record(&self) -> MutexGuard<'_, RefreshRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ArpRefreshStatus) -> ArpRefreshStatus {
        let mut record = self.record();
        record.status = status;
        if status == ArpRefreshStatus::Completed {
            record.updated = Some(Utc::now());
        }
        status
    }

    pub fn last_refresh_status(&self) -> ArpRefreshStatus {
        self.record().status
    }

    /// When the last refresh completed.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.record().updated
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ArpItem> {
        self.cache.snapshot()
    }

    /// Reloads the cache from the system ARP table.
    ///
    /// Each attempt at the command gets `timeout`. The command is retried
    /// `retry_attempts` times with `retry_delay` between attempts. Entries
    /// parsed before a cancellation stay in the cache.
    pub async fn refresh(
        &self,
        cancel: &CancellationToken,
        clear_first: bool,
        timeout: Duration,
    ) -> ArpRefreshStatus {
        let _refreshing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.set_status(ArpRefreshStatus::Cancelled),
            guard = self.refreshing.lock() => guard,
        };

        self.set_status(ArpRefreshStatus::Running);
        if clear_first {
            self.cache.clear();
        }

        let output = match self.query_with_retry(cancel, timeout).await {
            Ok(Some(output)) => output,
            Ok(None) => return self.set_status(ArpRefreshStatus::Cancelled),
            Err(e) => {
                tracing::warn!(
                    "ARP refresh failed after {} attempts: {}",
                    self.config.retry_attempts.max(1),
                    e
                );
                return self.set_status(ArpRefreshStatus::Failed);
            }
        };

        // Give the process a moment to exit cleanly before we parse.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.set_status(ArpRefreshStatus::Cancelled),
            _ = tokio::time::sleep(self.config.process_exit_delay) => {}
        }

        self.set_status(ArpRefreshStatus::Processed);
        let seen = Utc::now();
        let mut updated = 0usize;
        for line in output.lines() {
            if cancel.is_cancelled() {
                tracing::debug!("ARP refresh cancelled after {} entries", updated);
                return self.set_status(ArpRefreshStatus::Cancelled);
            }

            match parse_arp_line(line) {
                Ok(Some((ip_address, physical_address))) => {
                    self.cache.update(physical_address, ip_address, seen);
                    updated += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Skipping ARP line {:?}: {}", line, e),
            }
            // Lets a cancellation land between lines of a long table.
            tokio::task::yield_now().await;
        }

        tracing::debug!("ARP refresh complete: {} entries seen, {} cached", updated, self.cache.len());
        self.set_status(ArpRefreshStatus::Completed)
    }

    /// Runs the command until it succeeds or the attempts run out.
    /// `Ok(None)` means the caller cancelled.
    async fn query_with_retry(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<String>, DiscoveryError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = self.source.query(timeout) => result,
            };

            match result {
                Ok(output) => return Ok(Some(output)),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => tracing::debug!(attempt, "ARP query failed, retrying: {}", e),
            }

            attempt += 1;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }
    }

    /// Cache-only lookup by IP address.
    pub fn arp_item(&self, ip_address: Ipv4Addr) -> Option<ArpItem> {
        self.cache.by_ip(ip_address)
    }

    /// Looks up `ip_address`, probing it and refreshing the cache on a miss.
    pub async fn arp_item_for(
        &self,
        ip_address: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Option<ArpItem> {
        if let Some(item) = self.cache.by_ip(ip_address) {
            return Some(item);
        }

        // Sending anything to the address makes the kernel resolve it.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            reply = self.scanner.ping_address(ip_address) => {
                tracing::trace!("Probe of {} before ARP refresh: {:?}", ip_address, reply.status);
            }
        }

        self.refresh(cancel, false, self.config.command_timeout).await;
        self.cache.by_ip(ip_address)
    }

    pub async fn physical_address_for(
        &self,
        ip_address: Ipv4Addr,
        cancel: &CancellationToken,
    ) -> Option<MacAddress> {
        self.arp_item_for(ip_address, cancel)
            .await
            .map(|item| item.physical_address)
    }

    /// Looks up the IP address of `physical_address`, refreshing once on a
    /// miss when `refresh_if_missing` is set.
    pub async fn ip_address_for(
        &self,
        physical_address: MacAddress,
        refresh_if_missing: bool,
        cancel: &CancellationToken,
    ) -> Option<Ipv4Addr> {
        if let Some(item) = self.cache.by_physical(physical_address) {
            return Some(item.ip_address);
        }
        if !refresh_if_missing {
            return None;
        }

        self.refresh(cancel, false, self.config.command_timeout).await;
        self.cache
            .by_physical(physical_address)
            .map(|item| item.ip_address)
    }

    /// Blocking form of [`ArpService::ip_address_for`].
    ///
    /// A refresh runs on its own thread and runtime and is abandoned after
    /// `lookup_timeout`. Never call this from an async task; use
    /// `spawn_blocking` instead.
    pub fn get_ip_address(
        self: &Arc<Self>,
        physical_address: MacAddress,
        refresh_if_missing: bool,
    ) -> Option<Ipv4Addr> {
        if let Some(item) = self.cache.by_physical(physical_address) {
            return Some(item.ip_address);
        }
        if !refresh_if_missing {
            return None;
        }

        self.run_blocking(move |service, cancel| async move {
            service
                .ip_address_for(physical_address, true, &cancel)
                .await
        })
    }

    /// Blocking form of [`ArpService::physical_address_for`].
    pub fn get_physical_address(self: &Arc<Self>, ip_address: Ipv4Addr) -> Option<MacAddress> {
        if let Some(item) = self.cache.by_ip(ip_address) {
            return Some(item.physical_address);
        }

        self.run_blocking(move |service, cancel| async move {
            service.physical_address_for(ip_address, &cancel).await
        })
    }

    fn run_blocking<T, F, Fut>(self: &Arc<Self>, lookup: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Self>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Option<T>>,
    {
        let service = Arc::clone(self);
        let cancel = self.shutdown.child_token();
        let lookup_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel();

        let spawned = std::thread::Builder::new()
            .name("arp-lookup".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::warn!("Failed to build runtime for ARP lookup: {}", e);
                        return;
                    }
                };
                let result = runtime.block_on(lookup(service, lookup_cancel));
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn ARP lookup thread: {}", e);
            return None;
        }

        match rx.recv_timeout(self.config.lookup_timeout) {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("ARP lookup gave up after {:?}", self.config.lookup_timeout);
                cancel.cancel();
                None
            }
        }
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.lifecycle.subscribe()
    }

    /// Runs one refresh immediately, then every `refresh_interval`.
    pub fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        self.lifecycle.transition(ServiceState::Starting)?;

        let service = Arc::clone(self);
        let worker = Worker::spawn(&self.shutdown, move |cancel| async move {
            service.refresh_loop(cancel).await;
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);

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

    async fn refresh_loop(&self, cancel: CancellationToken) {
        self.refresh(&cancel, false, self.config.command_timeout).await;

        let Some(period) = loop_period(self.config.refresh_interval) else {
            return;
        };
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.refresh(&cancel, false, self.config.command_timeout).await;
                }
            }
        }
    }
}
