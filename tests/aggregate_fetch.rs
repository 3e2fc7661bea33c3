// tests/aggregate_fetch.rs
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use geo_event_aggregator::config::AggregatorConfig;
use geo_event_aggregator::ingest::scheduler::spawn_refresh_tasks;
use geo_event_aggregator::{Aggregator, Event, GeoPoint, SourceAdapter, StreamSink};

#[derive(Clone, Copy)]
enum Behavior {
    Ok,
    Fail,
    Panic,
}

struct MockAdapter {
    name: String,
    events: Vec<Event>,
    delay: Duration,
    behavior: Behavior,
    enabled: bool,
    stream: bool,
    calls: AtomicUsize,
}

impl MockAdapter {
    fn new(name: &str, events: Vec<Event>) -> Self {
        Self {
            name: name.to_string(),
            events,
            delay: Duration::ZERO,
            behavior: Behavior::Ok,
            enabled: true,
            stream: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn delayed(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    fn behaving(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn fetch_data(&self, stream: &StreamSink) -> Result<Vec<Event>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.stream {
            for ev in &self.events {
                stream.push(ev.clone());
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            Behavior::Ok => Ok(self.events.clone()),
            Behavior::Fail => Err(anyhow!("upstream returned 502")),
            Behavior::Panic => panic!("adapter bug"),
        }
    }
}

fn ev(source: &str, title: &str, secs: i64) -> Event {
    let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
    Event::new(source, title, ts, GeoPoint::new(35.0, 139.0))
}

fn agg() -> Aggregator {
    Aggregator::new(AggregatorConfig::default())
}

#[tokio::test(start_paused = true)]
async fn three_adapters_one_event_each_land_in_completion_order() {
    let a = agg();
    a.register_source(Arc::new(MockAdapter::new("slow", vec![ev("slow", "S", 1)]).delayed(30)));
    a.register_source(Arc::new(MockAdapter::new("fast", vec![ev("fast", "F", 2)]).delayed(10)));
    a.register_source(Arc::new(MockAdapter::new("mid", vec![ev("mid", "M", 3)]).delayed(20)));
    let mut rx = a.subscribe();

    let merged = a.fetch_all().await;
    assert_eq!(merged.len(), 3);

    let mut order = Vec::new();
    while let Ok(n) = rx.try_recv() {
        assert_eq!(n.events.len(), 1);
        order.push((n.source, n.total_count));
    }
    assert_eq!(
        order,
        vec![
            ("fast".to_string(), 1),
            ("mid".to_string(), 2),
            ("slow".to_string(), 3)
        ]
    );
}

#[tokio::test]
async fn failing_and_panicking_adapters_are_isolated() {
    let a = agg();
    a.register_source(Arc::new(MockAdapter::new("good", vec![ev("good", "ok", 1)])));
    a.register_source(Arc::new(
        MockAdapter::new("broken", vec![ev("broken", "x", 2)]).behaving(Behavior::Fail),
    ));
    a.register_source(Arc::new(
        MockAdapter::new("buggy", vec![ev("buggy", "y", 3)]).behaving(Behavior::Panic),
    ));

    let merged = a.fetch_all().await;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].source, "good");

    let stats = a.get_cache_stats();
    let broken = &stats.sources["broken"];
    assert!(!broken.stats.healthy);
    assert_eq!(broken.stats.errors, 1);
    assert!(broken
        .stats
        .last_error
        .as_deref()
        .unwrap()
        .contains("502"));
    assert!(!stats.sources["buggy"].stats.healthy);
    assert!(stats.sources["good"].stats.healthy);
    assert_eq!(stats.sources["good"].stats.fetched, 1);
}

#[tokio::test]
async fn every_adapter_failing_still_returns_the_cache() {
    let a = agg();
    a.ingest_batch("manual", vec![ev("manual", "kept", 1)]);
    a.register_source(Arc::new(MockAdapter::new("x", vec![]).behaving(Behavior::Fail)));
    a.register_source(Arc::new(MockAdapter::new("y", vec![]).behaving(Behavior::Fail)));

    let merged = a.fetch_all().await;
    assert_eq!(merged.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_adapter_times_out_without_blocking_others() {
    let a = Aggregator::new(AggregatorConfig {
        fetch_timeout_secs: 5,
        ..AggregatorConfig::default()
    });
    a.register_source(Arc::new(MockAdapter::new("hung", vec![ev("hung", "h", 1)]).delayed(60_000)));
    a.register_source(Arc::new(MockAdapter::new("quick", vec![ev("quick", "q", 2)])));

    let started = tokio::time::Instant::now();
    let merged = a.fetch_all().await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(merged.len(), 1);

    let stats = a.get_cache_stats();
    let hung = &stats.sources["hung"].stats;
    assert!(hung.last_error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn streamed_events_notify_individually_and_batch_copy_is_deduplicated() {
    let a = agg();
    let events = vec![ev("live", "first", 1), ev("live", "second", 2)];
    a.register_source(Arc::new(MockAdapter::new("live", events).streaming()));
    let mut rx = a.subscribe();

    a.fetch_all().await;
    assert_eq!(a.total_count(), 2);

    let mut notes = Vec::new();
    while let Ok(n) = rx.try_recv() {
        notes.push(n);
    }
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|n| n.events.len() == 1));
    assert_eq!(notes[1].total_count, 2);

    // Second round: nothing new, nothing published.
    a.fetch_all().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(a.get_cache_stats().unique_fingerprints, 2);
}

#[tokio::test]
async fn disabled_sources_are_skipped_until_enabled() {
    let a = agg();
    let off = Arc::new(MockAdapter::new("off", vec![ev("off", "o", 1)]).disabled());
    let on = Arc::new(MockAdapter::new("on", vec![ev("on", "n", 1)]));
    a.register_source(off.clone());
    a.register_source(on.clone());

    a.fetch_all().await;
    assert_eq!(off.calls.load(Ordering::SeqCst), 0);
    assert_eq!(on.calls.load(Ordering::SeqCst), 1);
    assert!(!a.get_cache_stats().sources["off"].enabled);

    assert!(a.set_source_enabled("on", false));
    assert_eq!(a.fetch_source("on").await, 0);
    assert_eq!(on.calls.load(Ordering::SeqCst), 1);
    // Disabling keeps what is already cached.
    assert_eq!(a.total_count(), 1);

    assert!(!a.set_source_enabled("missing", true));
    assert_eq!(a.fetch_source("missing").await, 0);
}

#[tokio::test]
async fn duplicate_registration_is_ignored() {
    let a = agg();
    assert!(a.register_source(Arc::new(MockAdapter::new("usgs", vec![ev("usgs", "1", 1)]))));
    assert!(!a.register_source(Arc::new(MockAdapter::new("usgs", vec![ev("usgs", "2", 2)]))));
    assert_eq!(a.source_names(), vec!["usgs".to_string()]);

    let merged = a.fetch_all().await;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].title, "1");
}

#[tokio::test]
async fn stats_reflect_counts_caps_and_last_update() {
    let a = Aggregator::new(AggregatorConfig {
        max_total_points: 3,
        max_points_per_source: 2,
        ..AggregatorConfig::default()
    });
    assert!(a.get_cache_stats().last_update.is_none());

    a.ingest_batch("a", vec![ev("a", "1", 1), ev("a", "2", 2), ev("a", "3", 3)]);
    a.ingest_batch("b", vec![ev("b", "1", 4), ev("b", "2", 5)]);

    let s = a.get_cache_stats();
    assert_eq!(s.total_points, 3);
    assert_eq!(s.max_total_points, 3);
    assert_eq!(s.max_points_per_source, 2);
    assert_eq!(s.unique_fingerprints, 3);
    assert_eq!(s.sources["a"].count, 1);
    assert_eq!(s.sources["b"].count, 2);
    assert!(s.last_update.is_some());

    let titles: HashSet<String> = a
        .get_cached_data(None)
        .into_iter()
        .map(|e| format!("{}{}", e.source, e.title))
        .collect();
    assert_eq!(
        titles,
        ["a3", "b1", "b2"].iter().map(|s| s.to_string()).collect()
    );
}

struct Ticker {
    calls: AtomicUsize,
}

#[async_trait]
impl SourceAdapter for Ticker {
    fn name(&self) -> &str {
        "ticker"
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn fetch_data(&self, _stream: &StreamSink) -> Result<Vec<Event>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(vec![ev("ticker", &format!("tick {n}"), n)])
    }
}

#[tokio::test(start_paused = true)]
async fn refresh_tasks_fetch_on_each_interval() {
    let a = agg();
    let t = Arc::new(Ticker {
        calls: AtomicUsize::new(0),
    });
    a.register_source(t.clone());

    let handles = spawn_refresh_tasks(&a);
    assert_eq!(handles.len(), 1);

    // First tick fires one interval after spawn.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(t.calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    assert_eq!(a.total_count(), 3);

    for h in handles {
        h.abort();
    }
}
