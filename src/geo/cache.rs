//! Absolute-TTL map (no sliding refresh on reads). Expired entries are swept on
//! insert at most once per TTL, so the map holds at most about two TTLs' worth of keys.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: HashMap<String, (Instant, V)>,
    last_sweep: Instant,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Live entry for `key`, if any. Expired entries are left for `purge_expired`.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: String, value: V) {
        if self.last_sweep.elapsed() >= self.ttl {
            self.purge_expired();
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.last_sweep = Instant::now();
        self.entries.retain(|_, (stored, _)| stored.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
