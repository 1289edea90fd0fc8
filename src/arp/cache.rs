use crate::addr::MacAddress;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// One IP ↔ MAC binding observed in the system ARP table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpItem {
    pub physical_address: MacAddress,
    pub ip_address: Ipv4Addr,
    /// When this hardware address was first seen.
    pub created: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct ArpMaps {
    by_physical: HashMap<MacAddress, ArpItem>,
    by_ip: HashMap<Ipv4Addr, MacAddress>,
}

/// Bidirectional ARP cache.
///
/// Both indexes live behind one mutex and every item is reachable from
/// exactly one key in each. The lock is never held across an await.
#[derive(Default)]
pub struct ArpCache {
    maps: Mutex<ArpMaps>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn maps(&self) -> MutexGuard<'_, ArpMaps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `physical_address` answered at `ip_address`.
    ///
    /// A known hardware address keeps its entry (and creation time); only
    /// its IP key and `last_seen` move. If another hardware address held
    /// `ip_address`, that stale entry is evicted.
    pub fn update(
        &self,
        physical_address: MacAddress,
        ip_address: Ipv4Addr,
        seen: DateTime<Utc>,
    ) -> ArpItem {
        let mut guard = self.maps();
        let ArpMaps { by_physical, by_ip } = &mut *guard;

        if let Some(owner) = by_ip.get(&ip_address).copied() {
            if owner != physical_address {
                tracing::debug!(
                    ip = %ip_address,
                    old = %owner,
                    new = %physical_address,
                    "ARP address moved to a new hardware address"
                );
                by_physical.remove(&owner);
                by_ip.remove(&ip_address);
            }
        }

        match by_physical.get_mut(&physical_address) {
            Some(item) => {
                if item.ip_address != ip_address {
                    by_ip.remove(&item.ip_address);
                    item.ip_address = ip_address;
                    by_ip.insert(ip_address, physical_address);
                }
                item.last_seen = seen;
                item.clone()
            }
            None => {
                let item = ArpItem {
                    physical_address,
                    ip_address,
                    created: seen,
                    last_seen: seen,
                };
                by_physical.insert(physical_address, item.clone());
                by_ip.insert(ip_address, physical_address);
                item
            }
        }
    }

    pub fn by_ip(&self, ip_address: Ipv4Addr) -> Option<ArpItem> {
        let maps = self.maps();
        let physical_address = maps.by_ip.get(&ip_address)?;
        maps.by_physical.get(physical_address).cloned()
    }

    pub fn by_physical(&self, physical_address: MacAddress) -> Option<ArpItem> {
        self.maps().by_physical.get(&physical_address).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps().by_physical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut maps = self.maps();
        maps.by_physical.clear();
        maps.by_ip.clear();
    }

    /// All items, ordered by IP address.
    pub fn snapshot(&self) -> Vec<ArpItem> {
        let mut items: Vec<ArpItem> = self.maps().by_physical.values().cloned().collect();
        items.sort_by_key(|item| item.ip_address);
        items
    }

    /// Checks that the two indexes describe the same set of items.
    pub fn is_consistent(&self) -> bool {
        let maps = self.maps();
        maps.by_ip.len() == maps.by_physical.len()
            && maps.by_ip.iter().all(|(ip, mac)| {
                maps.by_physical
                    .get(mac)
                    .is_some_and(|item| item.ip_address == *ip)
            })
    }
}
