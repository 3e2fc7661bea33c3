//! # Aggregation Engine
//! Owns the merged event cache, deduplicates by content fingerprint, enforces the
//! per-source and global caps, and publishes change notifications.
//!
//! All state sits behind one mutex. Each public operation does its whole mutation
//! in a single critical section that never spans an `.await`, so an event is
//! accepted and indexed atomically and no half-applied batch is ever observable.
//!
//! Eviction always drops the event with the oldest `occurred_at` (ties: the
//! earlier-inserted event survives), on both the batch and the streaming path.

pub mod notify;
pub mod record;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::ingest::types::{Event, SourceAdapter};
use crate::metrics::{
    ensure_metrics_described, ACCEPTED_TOTAL, ADAPTER_ERRORS_TOTAL, CACHE_POINTS,
    DUPLICATES_TOTAL, EVICTED_TOTAL, FETCH_MS,
};

pub use notify::{ChangeNotification, StreamSink};
pub use record::{SourceRecord, SourceStats};

use record::{insert_newest_first, sort_newest_first, truncate_tail};

/// Refresh cadence assumed for sources that ingest without a registered adapter.
const UNREGISTERED_REFRESH: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub count: usize,
    pub enabled: bool,
    pub refresh_interval_secs: u64,
    #[serde(flatten)]
    pub stats: SourceStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_points: usize,
    pub max_total_points: usize,
    pub max_points_per_source: usize,
    pub unique_fingerprints: usize,
    pub sources: BTreeMap<String, SourceSummary>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CacheState {
    records: BTreeMap<String, SourceRecord>,
    /// Newest-first merge of every record, capped.
    cache: Vec<Event>,
    /// fingerprint -> key of the record holding it.
    index: HashMap<String, String>,
    last_update: Option<DateTime<Utc>>,
}

impl CacheState {
    fn record_mut(&mut self, source: &str) -> &mut SourceRecord {
        self.records
            .entry(source.to_string())
            .or_insert_with(|| SourceRecord::new(true, UNREGISTERED_REFRESH))
    }

    /// Drop an event everywhere it is reachable from (index, record, cache).
    fn evict(&mut self, fingerprint: &str) {
        if let Some(source) = self.index.remove(fingerprint) {
            if let Some(record) = self.records.get_mut(&source) {
                record.remove(fingerprint);
            }
        }
        if let Some(pos) = self.cache.iter().position(|e| e.fingerprint == fingerprint) {
            self.cache.remove(pos);
        }
    }

    /// Full rebuild: merge all records, sort newest-first, cap. Overflow leaves its
    /// record and the index too. Returns the number evicted.
    fn rebuild_cache(&mut self, cap: usize) -> usize {
        let mut merged: Vec<Event> = self
            .records
            .values()
            .flat_map(|r| r.events().iter().cloned())
            .collect();
        sort_newest_first(&mut merged);
        let overflow = truncate_tail(&mut merged, cap);
        self.cache = merged;
        for ev in &overflow {
            self.evict(&ev.fingerprint);
        }
        overflow.len()
    }
}

struct Inner {
    config: AggregatorConfig,
    adapters: RwLock<BTreeMap<String, Arc<dyn SourceAdapter>>>,
    state: Mutex<CacheState>,
    notifier: broadcast::Sender<ChangeNotification>,
}

/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        ensure_metrics_described();
        let (notifier, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                adapters: RwLock::new(BTreeMap::new()),
                state: Mutex::new(CacheState::default()),
                notifier,
            }),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    /// Register an adapter. Names are unique: a second registration under the same
    /// name is logged and ignored. Returns whether the adapter was added.
    pub fn register_source(&self, adapter: Arc<dyn SourceAdapter>) -> bool {
        let name = adapter.name().to_string();
        let mut adapters = self.inner.adapters.write();
        if adapters.contains_key(&name) {
            warn!(target: "aggregate", source = %name, "source already registered, ignoring");
            return false;
        }

        {
            let mut st = self.inner.state.lock();
            let record = st.record_mut(&name);
            record.enabled = adapter.is_enabled();
            record.refresh_interval = adapter.refresh_interval();
        }

        info!(
            target: "aggregate",
            source = %name,
            refresh_secs = adapter.refresh_interval().as_secs(),
            "source registered"
        );
        adapters.insert(name, adapter);
        true
    }

    /// Registered source names, sorted.
    pub fn source_names(&self) -> Vec<String> {
        self.inner.adapters.read().keys().cloned().collect()
    }

    pub(crate) fn adapter(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.inner.adapters.read().get(name).cloned()
    }

    /// Enable or disable a registered source without dropping its cached events.
    pub fn set_source_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut st = self.inner.state.lock();
        match st.records.get_mut(name) {
            Some(record) => {
                record.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// New receiver for change notifications. Lagging receivers skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.notifier.subscribe()
    }

    /// Ingest one adapter batch. Every event is relabelled with `source` before it is
    /// fingerprinted. Returns how many of its events ended up cached.
    pub fn ingest_batch(&self, source: &str, events: Vec<Event>) -> usize {
        let cfg = &self.inner.config;
        let incoming = events.len();

        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;

            // Accept-then-index: indexing each event as it is accepted also rejects
            // repeats later in the same batch.
            let mut accepted = Vec::new();
            for mut ev in events {
                ev.source = source.to_string();
                ev.refresh_fingerprint();
                if st.index.contains_key(&ev.fingerprint) {
                    continue;
                }
                st.index.insert(ev.fingerprint.clone(), source.to_string());
                accepted.push(ev);
            }
            let duplicates = incoming - accepted.len();
            counter!(DUPLICATES_TOTAL).increment(duplicates as u64);
            if accepted.is_empty() {
                debug!(target: "aggregate", source, duplicates, "batch fully deduplicated");
                return 0;
            }

            let dropped = st
                .record_mut(source)
                .extend_and_truncate(accepted.clone(), cfg.max_points_per_source);
            for ev in &dropped {
                st.index.remove(&ev.fingerprint);
            }
            let evicted = dropped.len() + st.rebuild_cache(cfg.max_total_points);

            accepted.retain(|e| st.index.contains_key(&e.fingerprint));
            let now = Utc::now();
            st.last_update = Some(now);
            let total = st.cache.len();

            counter!(ACCEPTED_TOTAL).increment(accepted.len() as u64);
            counter!(EVICTED_TOTAL).increment(evicted as u64);
            gauge!(CACHE_POINTS).set(total as f64);
            debug!(
                target: "aggregate",
                source,
                incoming,
                accepted = accepted.len(),
                duplicates,
                evicted,
                total,
                "batch ingested"
            );

            if accepted.is_empty() {
                return 0;
            }
            let n = accepted.len();
            // Sent under the lock so subscribers see `total_count` in commit order.
            // No subscribers is fine.
            let _ = self.inner.notifier.send(ChangeNotification {
                source: source.to_string(),
                events: accepted,
                total_count: total,
                timestamp: now,
            });
            n
        }
    }

    /// Streaming path: one event, merged incrementally without a full re-sort.
    /// Returns `true` if it was accepted.
    pub fn ingest_single(&self, source: &str, mut event: Event) -> bool {
        let cfg = &self.inner.config;
        event.source = source.to_string();
        event.refresh_fingerprint();

        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;

            if st.index.contains_key(&event.fingerprint) {
                counter!(DUPLICATES_TOTAL).increment(1);
                return false;
            }
            st.index.insert(event.fingerprint.clone(), source.to_string());

            let mut evicted = 0usize;
            let dropped = st
                .record_mut(source)
                .insert_and_truncate(event.clone(), cfg.max_points_per_source);
            for ev in &dropped {
                st.evict(&ev.fingerprint);
                evicted += 1;
            }

            if st.index.contains_key(&event.fingerprint) {
                insert_newest_first(&mut st.cache, event.clone());
                let overflow = truncate_tail(&mut st.cache, cfg.max_total_points);
                for ev in &overflow {
                    st.evict(&ev.fingerprint);
                    evicted += 1;
                }
            }

            let survived = st.index.contains_key(&event.fingerprint);
            let now = Utc::now();
            st.last_update = Some(now);
            let total = st.cache.len();

            counter!(EVICTED_TOTAL).increment(evicted as u64);
            gauge!(CACHE_POINTS).set(total as f64);
            if !survived {
                debug!(target: "aggregate", source, "streamed event older than everything held, evicted");
                return false;
            }
            counter!(ACCEPTED_TOTAL).increment(1);

            let _ = self.inner.notifier.send(ChangeNotification {
                source: source.to_string(),
                events: vec![event],
                total_count: total,
                timestamp: now,
            });
            true
        }
    }

    /// Fetch every enabled adapter concurrently. Each result is ingested as soon as
    /// that adapter finishes; failures are logged and contribute nothing. Returns
    /// the merged cache once all adapters have resolved.
    pub async fn fetch_all(&self) -> Vec<Event> {
        let adapters: Vec<Arc<dyn SourceAdapter>> =
            self.inner.adapters.read().values().cloned().collect();
        let adapters: Vec<_> = {
            let st = self.inner.state.lock();
            adapters
                .into_iter()
                .filter(|a| {
                    a.is_enabled()
                        && st.records.get(a.name()).map(|r| r.enabled).unwrap_or(true)
                })
                .collect()
        };

        let mut tasks = JoinSet::new();
        for adapter in adapters {
            let this = self.clone();
            tasks.spawn(async move { this.run_adapter(adapter).await });
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(target: "aggregate", error = %e, "fetch task aborted");
            }
        }

        self.get_cached_data(None)
    }

    /// Fetch a single registered source. Returns how many events were newly cached.
    pub async fn fetch_source(&self, name: &str) -> usize {
        let Some(adapter) = self.adapter(name) else {
            warn!(target: "aggregate", source = name, "fetch requested for unknown source");
            return 0;
        };
        let enabled = adapter.is_enabled()
            && self
                .inner
                .state
                .lock()
                .records
                .get(name)
                .map(|r| r.enabled)
                .unwrap_or(true);
        if !enabled {
            debug!(target: "aggregate", source = name, "source disabled, skipping fetch");
            return 0;
        }
        self.run_adapter(adapter).await
    }

    async fn run_adapter(&self, adapter: Arc<dyn SourceAdapter>) -> usize {
        let name = adapter.name().to_string();
        let sink = StreamSink::new(self.clone(), name.clone());
        let started = Instant::now();

        // Own task so a panicking adapter is contained like any other failure.
        let mut task = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.fetch_data(&sink).await })
        };
        let outcome = match tokio::time::timeout(self.inner.config.fetch_timeout(), &mut task).await
        {
            Ok(Ok(Ok(events))) => Ok(events),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Err(join)) => Err(format!("adapter task failed: {join}")),
            Err(_) => {
                task.abort();
                Err(format!(
                    "fetch timed out after {}s",
                    self.inner.config.fetch_timeout_secs
                ))
            }
        };
        histogram!(FETCH_MS).record(started.elapsed().as_secs_f64() * 1_000.0);

        let now = Utc::now();
        match outcome {
            Ok(events) => {
                let fetched = events.len();
                self.inner
                    .state
                    .lock()
                    .record_mut(&name)
                    .record_success(fetched, now);
                let accepted = self.ingest_batch(&name, events);
                info!(target: "aggregate", source = %name, fetched, accepted, "fetch complete");
                accepted
            }
            Err(error) => {
                warn!(target: "aggregate", source = %name, %error, "fetch failed");
                counter!(ADAPTER_ERRORS_TOTAL, "source" => name.clone()).increment(1);
                self.inner
                    .state
                    .lock()
                    .record_mut(&name)
                    .record_failure(error, now);
                0
            }
        }
    }

    /// Empty the cache, every record and the index in one step.
    pub fn clear_cache(&self) {
        let mut st = self.inner.state.lock();
        st.cache.clear();
        st.index.clear();
        for record in st.records.values_mut() {
            record.clear();
        }
        st.last_update = Some(Utc::now());
        gauge!(CACHE_POINTS).set(0.0);
        info!(target: "aggregate", "cache cleared");
    }

    /// Point-in-time copy of the cache, newest-first, optionally limited to the given
    /// source names (case-insensitive).
    pub fn get_cached_data(&self, sources: Option<&[&str]>) -> Vec<Event> {
        let st = self.inner.state.lock();
        match sources {
            None => st.cache.clone(),
            Some(names) => {
                let wanted: HashSet<String> = names.iter().map(|s| s.to_lowercase()).collect();
                st.cache
                    .iter()
                    .filter(|e| wanted.contains(&e.source.to_lowercase()))
                    .cloned()
                    .collect()
            }
        }
    }

    pub fn total_count(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let cfg = &self.inner.config;
        let st = self.inner.state.lock();
        let sources = st
            .records
            .iter()
            .map(|(name, r)| {
                (
                    name.clone(),
                    SourceSummary {
                        count: r.len(),
                        enabled: r.enabled,
                        refresh_interval_secs: r.refresh_interval.as_secs(),
                        stats: r.stats.clone(),
                    },
                )
            })
            .collect();
        CacheStats {
            total_points: st.cache.len(),
            max_total_points: cfg.max_total_points,
            max_points_per_source: cfg.max_points_per_source,
            unique_fingerprints: st.index.len(),
            sources,
            last_update: st.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::GeoPoint;
    use chrono::TimeZone;

    fn agg(total: usize, per_source: usize) -> Aggregator {
        Aggregator::new(AggregatorConfig {
            max_total_points: total,
            max_points_per_source: per_source,
            ..AggregatorConfig::default()
        })
    }

    fn ev(source: &str, title: &str, secs: i64) -> Event {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Event::new(source, title, ts, GeoPoint::new(10.0, 20.0))
    }

    /// Index == fingerprints reachable through records; cache == their merge.
    fn assert_consistent(a: &Aggregator) {
        let st = a.inner.state.lock();
        let cfg = &a.inner.config;
        let mut from_records: HashSet<&str> = HashSet::new();
        for (name, r) in &st.records {
            assert!(r.len() <= cfg.max_points_per_source, "{name} over cap");
            for e in r.events() {
                from_records.insert(e.fingerprint.as_str());
                assert_eq!(st.index.get(&e.fingerprint), Some(name));
            }
        }
        let indexed: HashSet<&str> = st.index.keys().map(String::as_str).collect();
        assert_eq!(indexed, from_records);
        let cached: HashSet<&str> = st.cache.iter().map(|e| e.fingerprint.as_str()).collect();
        assert_eq!(cached, from_records);
        assert!(st.cache.len() <= cfg.max_total_points);
        assert!(st
            .cache
            .windows(2)
            .all(|w| w[0].occurred_at >= w[1].occurred_at));
    }

    #[test]
    fn near_duplicate_with_new_copy_is_rejected() {
        let a = agg(100, 100);
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let first = Event::new("A", "Fire", ts, GeoPoint::new(40.7128, -74.0060)).with_url("u1");
        let second = Event::new("A", "Fire", ts, GeoPoint::new(40.71281, -74.00601))
            .with_url("u1")
            .with_description("different");
        assert_eq!(a.ingest_batch("A", vec![first]), 1);
        assert_eq!(a.ingest_batch("A", vec![second]), 0);
        assert_eq!(a.total_count(), 1);
        assert_consistent(&a);
    }

    #[test]
    fn repeats_inside_one_batch_are_dropped() {
        let a = agg(100, 100);
        let e = ev("A", "Quake", 0);
        assert_eq!(a.ingest_batch("A", vec![e.clone(), e.clone(), e]), 1);
        assert_consistent(&a);
    }

    #[test]
    fn per_source_cap_frees_fingerprint_for_reentry() {
        let a = agg(100, 2);
        let oldest = ev("A", "one", 0);
        a.ingest_batch("A", vec![oldest.clone(), ev("A", "two", 10), ev("A", "three", 20)]);
        let titles: Vec<_> = a.get_cached_data(None).into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["three", "two"]);
        assert_consistent(&a);

        // Free again: a newer copy of the same real-world event is accepted.
        let mut again = oldest;
        again.occurred_at = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        assert_eq!(a.ingest_batch("A", vec![again]), 1);
        assert_consistent(&a);
    }

    #[test]
    fn global_cap_evicts_from_records_too() {
        let a = agg(3, 10);
        a.ingest_batch("A", vec![ev("A", "a0", 0), ev("A", "a1", 10)]);
        a.ingest_batch("B", vec![ev("B", "b0", 5), ev("B", "b1", 15)]);
        assert_eq!(a.total_count(), 3);
        let stats = a.get_cache_stats();
        assert_eq!(stats.unique_fingerprints, 3);
        assert_eq!(stats.sources["A"].count, 1);
        assert_eq!(stats.sources["B"].count, 2);
        assert_consistent(&a);
    }

    #[test]
    fn streaming_insert_keeps_order_and_caps() {
        let a = agg(3, 10);
        let mut rx = a.subscribe();
        assert!(a.ingest_single("S", ev("S", "t20", 20)));
        assert!(a.ingest_single("S", ev("S", "t40", 40)));
        assert!(a.ingest_single("S", ev("S", "t30", 30)));
        assert!(!a.ingest_single("S", ev("S", "t30", 30)));
        assert!(a.ingest_single("S", ev("S", "t50", 50)));
        // Backfill older than the whole full cache never becomes visible.
        assert!(!a.ingest_single("S", ev("S", "t01", 1)));

        let titles: Vec<_> = a.get_cached_data(None).into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["t50", "t40", "t30"]);
        assert_consistent(&a);

        let mut n = 0;
        while let Ok(note) = rx.try_recv() {
            assert_eq!(note.events.len(), 1);
            n += 1;
        }
        assert_eq!(n, 4);
    }

    #[test]
    fn batch_and_stream_agree_on_what_is_oldest() {
        let by_batch = agg(100, 2);
        by_batch.ingest_batch("A", vec![ev("A", "new", 30), ev("A", "mid", 20)]);
        by_batch.ingest_batch("A", vec![ev("A", "old", 10)]);

        let by_stream = agg(100, 2);
        for e in [ev("A", "new", 30), ev("A", "mid", 20), ev("A", "old", 10)] {
            by_stream.ingest_single("A", e);
        }

        let t = |a: &Aggregator| -> Vec<String> {
            a.get_cached_data(None).into_iter().map(|e| e.title).collect()
        };
        assert_eq!(t(&by_batch), t(&by_stream));
        assert_consistent(&by_batch);
        assert_consistent(&by_stream);
    }

    #[test]
    fn clear_resets_everything_and_allows_reingest() {
        let a = agg(100, 100);
        let e = ev("A", "x", 0);
        a.ingest_batch("A", vec![e.clone()]);
        a.clear_cache();
        let stats = a.get_cache_stats();
        assert_eq!(stats.total_points, 0);
        assert_eq!(stats.unique_fingerprints, 0);
        assert_eq!(stats.sources["A"].count, 0);
        assert_eq!(a.ingest_batch("A", vec![e]), 1);
        assert_consistent(&a);
    }

    #[test]
    fn filtered_copy_is_case_insensitive_and_detached() {
        let a = agg(100, 100);
        a.ingest_batch("USGS", vec![ev("USGS", "q", 0)]);
        a.ingest_batch("GDACS", vec![ev("GDACS", "f", 5)]);

        let mut only = a.get_cached_data(Some(&["usgs"]));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].source, "USGS");

        only[0].title = "mutated".into();
        only.clear();
        assert_eq!(a.total_count(), 2);
        assert!(a.get_cached_data(None).iter().all(|e| e.title != "mutated"));
    }

    #[test]
    fn no_notification_for_duplicate_batch() {
        let a = agg(100, 100);
        let batch = vec![ev("A", "x", 0), ev("A", "y", 1)];
        a.ingest_batch("A", batch.clone());
        let mut rx = a.subscribe();
        assert_eq!(a.ingest_batch("A", batch), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(a.total_count(), 2);
    }

    #[test]
    fn events_are_filed_under_the_ingesting_source() {
        let a = agg(100, 100);
        assert_eq!(
            a.ingest_batch("usgs", vec![ev("USGS-feed", "q1", 0), ev("", "q2", 1)]),
            2
        );
        assert!(a.ingest_single("usgs", ev("other", "q3", 2)));

        let held = a.get_cached_data(Some(&["usgs"]));
        assert_eq!(held.len(), 3);
        assert!(held.iter().all(|e| e.source == "usgs"));
        assert!(held.iter().all(|e| e.fingerprint == crate::fingerprint::compute(e)));
        assert_eq!(a.get_cache_stats().sources["usgs"].count, 3);
        assert!(a.get_cached_data(Some(&["USGS-feed"])).is_empty());

        // Relabelled on the way in, so a copy carrying another label is still a duplicate.
        assert_eq!(a.ingest_batch("usgs", vec![ev("anything", "q1", 0)]), 0);
        assert_consistent(&a);
    }

    #[test]
    fn concurrent_ingest_notifies_in_commit_order() {
        let a = Aggregator::new(AggregatorConfig {
            max_total_points: 10_000,
            max_points_per_source: 10_000,
            notification_capacity: 1024,
            ..AggregatorConfig::default()
        });
        let mut rx = a.subscribe();

        std::thread::scope(|s| {
            for t in 0..4 {
                let a = a.clone();
                s.spawn(move || {
                    let src = format!("S{t}");
                    for i in 0..100 {
                        a.ingest_single(&src, ev(&src, &format!("e{i}"), i));
                    }
                });
            }
        });

        let mut totals = Vec::new();
        while let Ok(note) = rx.try_recv() {
            totals.push(note.total_count);
        }
        assert_eq!(totals.len(), 400);
        assert!(totals.windows(2).all(|w| w[0] < w[1]), "{totals:?}");
        assert_eq!(totals.last(), Some(&400));
    }
}
