use super::session::DhcpSession;
use crate::addr::MacAddress;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

pub type SharedSession = Arc<Mutex<DhcpSession>>;

/// The single record of known DHCP clients, one session per hardware
/// address. The map lock is held only for the map operation itself.
pub struct SessionStore {
    sessions: Mutex<HashMap<MacAddress, SharedSession>>,
    session_timeout: Duration,
}

impl SessionStore {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            session_timeout,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<MacAddress, SharedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn find_or_create(&self, physical_address: MacAddress) -> SharedSession {
        let mut sessions = self.sessions();
        let session = sessions.entry(physical_address).or_insert_with(|| {
            tracing::debug!(mac = %physical_address, "New DHCP session");
            Arc::new(Mutex::new(DhcpSession::new(
                physical_address,
                self.session_timeout,
            )))
        });
        Arc::clone(session)
    }

    pub fn get(&self, physical_address: MacAddress) -> Option<SharedSession> {
        self.sessions().get(&physical_address).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of every session, ordered by hardware address.
    pub fn snapshot(&self) -> Vec<DhcpSession> {
        let shared: Vec<SharedSession> = self.sessions().values().cloned().collect();
        let mut sessions: Vec<DhcpSession> = shared
            .iter()
            .map(|session| session.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        sessions.sort_by_key(|session| session.physical_address());
        sessions
    }

    /// Drops every session that has expired as of `now`; returns how many.
    /// A session still held outside the store is in use and is kept.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, session| {
            if Arc::strong_count(session) > 1 {
                return true;
            }
            let session = session.lock().unwrap_or_else(PoisonError::into_inner);
            !session.has_expired_at(now, session.session_timeout())
        });
        before - sessions.len()
    }
}
