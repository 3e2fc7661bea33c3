// src/ingest/types.rs
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::StreamSink;

/// WGS84 position of an event. Adapters only hand over events with valid coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            altitude: None,
            accuracy_meters: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    /// Content hash, see [`crate::fingerprint::compute`].
    pub fingerprint: String,
    pub occurred_at: DateTime<Utc>,
    pub location: GeoPoint,
    pub title: String,
    pub description: Option<String>,
    pub source_url: Option<String>,
    pub source: String, // e.g., "USGS", "GDACS"
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Event {
    /// Build an event and fingerprint it immediately.
    /// The id defaults to `source:<first 12 fingerprint chars>`.
    pub fn new(
        source: impl Into<String>,
        title: impl Into<String>,
        occurred_at: DateTime<Utc>,
        location: GeoPoint,
    ) -> Self {
        let mut ev = Self {
            id: String::new(),
            fingerprint: String::new(),
            occurred_at,
            location,
            title: title.into(),
            description: None,
            source_url: None,
            source: source.into(),
            category: None,
            metadata: BTreeMap::new(),
        };
        ev.refresh_fingerprint();
        ev.id = format!("{}:{}", ev.source, &ev.fingerprint[..12]);
        ev
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self.refresh_fingerprint();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Recompute `fingerprint` from the current defining fields.
    pub fn refresh_fingerprint(&mut self) {
        self.fingerprint = crate::fingerprint::compute(self);
    }
}

/// Contract every upstream feed adapter implements.
///
/// `fetch_data` returns the adapter's current batch. Adapters that see events in
/// near-real-time may push them through `stream` before the batch resolves; those
/// go through the streaming ingest path and the later batch copy is deduplicated.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    fn refresh_interval(&self) -> Duration;

    async fn fetch_data(&self, stream: &StreamSink) -> Result<Vec<Event>>;
}
