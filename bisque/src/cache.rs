// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared storage and aging machinery for the neighbor caches.
//!
//! The IPv6 ND cache and the IPv4 ARP cache share one entry shape and one
//! maintenance discipline; only the key type and the solicitation they emit
//! differ. This module owns the shape and the sweep; the per-family wrappers
//! own the solicitations.

use crate::clock::Clock;
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// A resolved address-to-link-layer binding.
#[derive(Debug, Clone, Copy)]
struct Entry {
    link_addr: EthernetAddress,
    permanent: bool,
    created_at: Instant,
    hit_count: u32,
}

/// What one maintenance sweep decided.
#[derive(Debug)]
pub(crate) struct SweepReport<K> {
    /// Entries evicted because they outlived the maximum age.
    pub expired: Vec<(K, EthernetAddress)>,
    /// Keys whose entries entered the trailing refresh window with a nonzero
    /// hit count; their hit counts were reset and the caller should solicit.
    pub refresh: Vec<K>,
}

/// Keyed entry storage with freshness tracking and snapshot-stable sweeps.
pub(crate) struct CacheStore<K> {
    entries: parking_lot::Mutex<HashMap<K, Entry>>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    refresh_window: Duration,
}

impl<K: Copy + Eq + Hash> CacheStore<K> {
    pub fn new(clock: Arc<dyn Clock>, max_age: Duration, refresh_window: Duration) -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
            clock,
            max_age,
            refresh_window,
        }
    }

    /// Inserts or refreshes an entry. Unconditionally overwrites: the age
    /// and hit count restart, and a previously permanent entry becomes
    /// ordinary.
    pub fn add(&self, key: K, link_addr: EthernetAddress) {
        self.insert(key, link_addr, false);
    }

    /// Inserts an entry that is never aged or refreshed.
    pub fn add_permanent(&self, key: K, link_addr: EthernetAddress) {
        self.insert(key, link_addr, true);
    }

    fn insert(&self, key: K, link_addr: EthernetAddress, permanent: bool) {
        self.entries.lock().insert(
            key,
            Entry {
                link_addr,
                permanent,
                created_at: self.clock.now(),
                hit_count: 0,
            },
        );
    }

    /// Looks up a binding, counting the hit. Returns `None` on a miss
    /// without creating an entry.
    pub fn get(&self, key: &K) -> Option<EthernetAddress> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.hit_count += 1;
        Some(entry.link_addr)
    }

    /// Removes an entry. Returns whether one was present.
    pub fn delete(&self, key: &K) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub fn hit_count(&self, key: &K) -> Option<u32> {
        self.entries.lock().get(key).map(|e| e.hit_count)
    }

    /// Runs one maintenance pass.
    ///
    /// Snapshots the key set first, then revisits each key under a short
    /// lock so concurrent mutation is never observed mid-update; keys
    /// deleted in between are skipped silently. An entry inside the trailing
    /// refresh window keeps its original `created_at`; only a subsequent
    /// `add` (driven by the peer's reply) restarts the age, so an
    /// unanswered refresh still expires on schedule.
    pub fn sweep(&self) -> SweepReport<K> {
        let keys: Vec<K> = self.entries.lock().keys().copied().collect();
        let refresh_after = self.max_age.saturating_sub(self.refresh_window);
        let now = self.clock.now();

        let mut report = SweepReport {
            expired: Vec::new(),
            refresh: Vec::new(),
        };
        for key in keys {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                continue;
            };
            if entry.permanent {
                continue;
            }
            let age = now.saturating_duration_since(entry.created_at);
            if age > self.max_age {
                let entry = entries.remove(&key).unwrap();
                report.expired.push((key, entry.link_addr));
            } else if age > refresh_after && entry.hit_count > 0 {
                entry.hit_count = 0;
                report.refresh.push(key);
            }
        }
        report
    }
}
