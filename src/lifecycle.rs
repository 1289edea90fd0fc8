//! Start/stop state tracking shared by every long-running component.

use crate::error::DiscoveryError;
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    fn can_become(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Owns a component's `ServiceState` and publishes every change.
pub struct Lifecycle {
    service: &'static str,
    state: watch::Sender<ServiceState>,
}

impl Lifecycle {
    pub fn new(service: &'static str) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self { service, state }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Moves to `next`, rejecting transitions outside
    /// `Stopped → Starting → Running → Stopping → Stopped`
    /// (a failed start may fall back from `Starting` to `Stopped`).
    pub fn transition(&self, next: ServiceState) -> Result<(), DiscoveryError> {
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if current.can_become(next) {
                tracing::debug!("{}: {:?} -> {:?}", self.service, current, next);
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        match rejected {
            Some(from) => Err(DiscoveryError::Lifecycle {
                service: self.service,
                from,
                to: next,
            }),
            None => Ok(()),
        }
    }
}

/// A spawned background loop together with the token that stops it.
pub struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    pub fn spawn<F, Fut>(parent: &CancellationToken, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let handle = tokio::spawn(body(cancel.clone()));
        Self { cancel, handle }
    }

    /// Cancels the loop and waits for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("Background worker ended abnormally: {}", e);
        }
    }
}

/// The period of a background loop, or `None` when it should not tick.
/// A zero period counts as disabled since `tokio::time::interval` rejects it.
pub fn loop_period(configured: Option<Duration>) -> Option<Duration> {
    configured.filter(|period| !period.is_zero())
}
