// src/ingest/providers/file_feed.rs
//! Adapter over a JSON array of feed records, read from disk on every fetch or
//! held in memory as a fixture. Records without usable coordinates are geotagged
//! through the location resolver when one is attached, otherwise dropped.
//!
//! Geocoding shares one budget per fetch. Once it is spent, records that still
//! need a lookup are dropped (cache hits still go through) and the rest of the
//! batch is kept, so queue pacing never pushes the whole fetch past its timeout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;

use crate::aggregate::StreamSink;
use crate::geo::LocationResolver;
use crate::ingest::normalize_title;
use crate::ingest::types::{Event, GeoPoint, SourceAdapter};

/// Keep below the aggregator's fetch timeout (30 s by default).
pub const DEFAULT_RESOLVE_BUDGET: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct FeedRecord {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
    lat: Option<f64>,
    lon: Option<f64>,
    altitude: Option<f64>,
    accuracy_meters: Option<f64>,
    category: Option<String>,
    /// Free text to geocode when lat/lon are missing; falls back to title + description.
    location_text: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

enum Located {
    At(GeoPoint, Option<String>),
    Nowhere,
    OutOfBudget,
}

enum Mode {
    Fixture(String),
    File(PathBuf),
}

pub struct FileFeedAdapter {
    name: String,
    mode: Mode,
    refresh: Duration,
    enabled: bool,
    streaming: bool,
    resolver: Option<Arc<LocationResolver>>,
    resolve_budget: Duration,
}

impl FileFeedAdapter {
    pub fn from_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::with_mode(name.into(), Mode::File(path.into()))
    }

    pub fn from_fixture(name: impl Into<String>, json: &str) -> Self {
        Self::with_mode(name.into(), Mode::Fixture(json.to_string()))
    }

    fn with_mode(name: String, mode: Mode) -> Self {
        Self {
            name,
            mode,
            refresh: Duration::from_secs(300),
            enabled: true,
            streaming: false,
            resolver: None,
            resolve_budget: DEFAULT_RESOLVE_BUDGET,
        }
    }

    pub fn refresh_every(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Push each record through the streaming path as soon as it is parsed.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<LocationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Total time one fetch may spend geocoding records without coordinates.
    pub fn resolve_budget(mut self, budget: Duration) -> Self {
        self.resolve_budget = budget;
        self
    }

    async fn load(&self) -> Result<String> {
        match &self.mode {
            Mode::Fixture(s) => Ok(s.clone()),
            Mode::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading feed file {}", path.display())),
        }
    }

    async fn locate(&self, rec: &FeedRecord, title: &str, deadline: Instant) -> Located {
        if let (Some(lat), Some(lon)) = (rec.lat, rec.lon) {
            let point = GeoPoint {
                lat,
                lon,
                altitude: rec.altitude,
                accuracy_meters: rec.accuracy_meters,
            };
            if point.is_valid() {
                return Located::At(point, None);
            }
        }

        let Some(resolver) = self.resolver.as_ref() else {
            return Located::Nowhere;
        };
        let text = match &rec.location_text {
            Some(t) => t.clone(),
            None => format!("{} {}", title, rec.description.as_deref().unwrap_or_default()),
        };
        match tokio::time::timeout_at(deadline, resolver.resolve_best_location(&text)).await {
            Ok(Some(resolved)) => Located::At(
                GeoPoint::new(resolved.lat, resolved.lon),
                resolved.formatted_address,
            ),
            Ok(None) => Located::Nowhere,
            Err(_) => Located::OutOfBudget,
        }
    }

    fn to_event(
        &self,
        rec: FeedRecord,
        title: String,
        location: GeoPoint,
        resolved_address: Option<String>,
    ) -> Event {
        let mut ev = Event::new(
            self.name.clone(),
            title,
            rec.occurred_at.unwrap_or_else(Utc::now),
            location,
        );
        if let Some(url) = rec.url {
            ev = ev.with_url(url);
        }
        if let Some(id) = rec.id {
            ev = ev.with_id(format!("{}:{}", self.name, id));
        }
        ev.description = rec.description;
        ev.category = rec.category;
        ev.metadata = rec.metadata;
        if let Some(addr) = resolved_address {
            ev = ev.with_metadata("resolved_address", serde_json::Value::String(addr));
        }
        ev
    }
}

#[async_trait]
impl SourceAdapter for FileFeedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn refresh_interval(&self) -> Duration {
        self.refresh
    }

    async fn fetch_data(&self, stream: &StreamSink) -> Result<Vec<Event>> {
        let raw = self.load().await?;
        let records: Vec<FeedRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing feed records for {}", self.name))?;

        let deadline = Instant::now() + self.resolve_budget;
        let total = records.len();
        let mut out = Vec::with_capacity(total);
        let mut over_budget = 0usize;
        for rec in records {
            let title = normalize_title(rec.title.as_deref().unwrap_or_default());
            if title.is_empty() {
                continue;
            }
            let (location, address) = match self.locate(&rec, &title, deadline).await {
                Located::At(point, address) => (point, address),
                Located::Nowhere => continue,
                Located::OutOfBudget => {
                    over_budget += 1;
                    continue;
                }
            };
            let ev = self.to_event(rec, title, location, address);
            if self.streaming {
                stream.push(ev.clone());
            }
            out.push(ev);
        }

        if over_budget > 0 {
            tracing::warn!(target: "ingest", source = %self.name, over_budget, "geocoding budget spent, records dropped");
        }
        let dropped = total - out.len();
        if dropped > 0 {
            tracing::debug!(target: "ingest", source = %self.name, dropped, "records without title or location dropped");
        }
        Ok(out)
    }
}
