//! Per-source bounded event list plus running fetch stats.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::ingest::types::Event;

/// Running counters for one source.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceStats {
    pub fetched: u64,
    pub errors: u64,
    pub healthy: bool,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for SourceStats {
    fn default() -> Self {
        Self {
            fetched: 0,
            errors: 0,
            healthy: true,
            last_fetch: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Newest-first.
    events: Vec<Event>,
    pub enabled: bool,
    pub refresh_interval: Duration,
    pub stats: SourceStats,
}

impl SourceRecord {
    pub fn new(enabled: bool, refresh_interval: Duration) -> Self {
        Self {
            events: Vec::new(),
            enabled,
            refresh_interval,
            stats: SourceStats::default(),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append a batch, then restore newest-first order and drop the oldest past `cap`.
    /// Returns what was dropped.
    pub fn extend_and_truncate(&mut self, accepted: Vec<Event>, cap: usize) -> Vec<Event> {
        self.events.extend(accepted);
        sort_newest_first(&mut self.events);
        truncate_tail(&mut self.events, cap)
    }

    /// Insert at the newest-first position without re-sorting; drops the oldest past `cap`.
    pub fn insert_and_truncate(&mut self, event: Event, cap: usize) -> Vec<Event> {
        insert_newest_first(&mut self.events, event);
        truncate_tail(&mut self.events, cap)
    }

    /// Remove one event by fingerprint. Returns whether it was present.
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        match self.events.iter().position(|e| e.fingerprint == fingerprint) {
            Some(i) => {
                self.events.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub(crate) fn record_success(&mut self, fetched: usize, now: DateTime<Utc>) {
        self.stats.fetched = self.stats.fetched.saturating_add(fetched as u64);
        self.stats.healthy = true;
        self.stats.last_fetch = Some(now);
        self.stats.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, error: String, now: DateTime<Utc>) {
        self.stats.errors = self.stats.errors.saturating_add(1);
        self.stats.healthy = false;
        self.stats.last_fetch = Some(now);
        self.stats.last_error = Some(error);
    }
}

/// Stable sort: among equal timestamps, earlier-inserted events stay ahead.
pub(crate) fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
}

/// Insert after every event at least as new, which matches where a stable
/// `sort_newest_first` would have put it.
pub(crate) fn insert_newest_first(events: &mut Vec<Event>, event: Event) -> usize {
    let pos = events.partition_point(|e| e.occurred_at >= event.occurred_at);
    events.insert(pos, event);
    pos
}

pub(crate) fn truncate_tail(events: &mut Vec<Event>, cap: usize) -> Vec<Event> {
    if events.len() > cap {
        events.split_off(cap)
    } else {
        Vec::new()
    }
}
