// src/geo/mod.rs
//! # Location Resolver
//! Turns free text into coordinates: extract candidate place names, filter them,
//! then resolve each through a TTL cache, a table of in-flight lookups and the
//! process-wide rate-limit queue, in that order.
//!
//! Failures never surface as errors. A geocoder error, timeout or empty answer is
//! cached as a negative result for the same TTL and reported as "no location".
//!
//! The resolver is an ordinary value: build one, wrap it in an `Arc`, and hand it
//! to every adapter that needs it so they share one cache and one queue.

pub mod cache;
pub mod extract;
pub mod provider;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::ResolverConfig;
use crate::ingest::types::GeoPoint;
use crate::metrics::{
    ensure_metrics_described, GEO_CACHE_HITS_TOTAL, GEO_CALLS_TOTAL, GEO_ERRORS_TOTAL,
};

pub use cache::TtlCache;
pub use extract::{filter_candidates, CapitalizedPhraseExtractor, PlaceExtractor};
pub use provider::{confidence, GeocodeMatch, Geocoder, NominatimGeocoder};
pub use rate_limit::RateLimitQueue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub original_text: String,
    pub lat: f64,
    pub lon: f64,
    pub formatted_address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub confidence: f64,
}

impl ResolvedLocation {
    fn from_match(original_text: &str, m: GeocodeMatch) -> Self {
        let confidence = confidence(&m);
        Self {
            original_text: original_text.to_string(),
            lat: m.lat,
            lon: m.lon,
            formatted_address: m.formatted_address,
            city: m.city,
            country: m.country,
            confidence,
        }
    }
}

type Lookup = Arc<OnceCell<Option<ResolvedLocation>>>;

pub struct LocationResolver {
    config: ResolverConfig,
    geocoder: Arc<dyn Geocoder>,
    extractor: Arc<dyn PlaceExtractor>,
    queue: RateLimitQueue,
    cache: Mutex<TtlCache<Option<ResolvedLocation>>>,
    in_flight: Mutex<HashMap<String, Lookup>>,
}

/// Cache key: lowercase, trimmed, inner whitespace collapsed.
fn normalize_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl LocationResolver {
    pub fn new(
        config: ResolverConfig,
        geocoder: Arc<dyn Geocoder>,
        extractor: Arc<dyn PlaceExtractor>,
    ) -> Self {
        ensure_metrics_described();
        Self {
            queue: RateLimitQueue::new(config.rate_limit_interval()),
            cache: Mutex::new(TtlCache::new(config.cache_ttl())),
            in_flight: Mutex::new(HashMap::new()),
            config,
            geocoder,
            extractor,
        }
    }

    /// Resolver with the built-in capitalized-phrase extractor.
    pub fn with_defaults(config: ResolverConfig, geocoder: Arc<dyn Geocoder>) -> Self {
        Self::new(config, geocoder, Arc::new(CapitalizedPhraseExtractor))
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// First candidate in `text` that resolves, in extraction order.
    pub async fn resolve_best_location(&self, text: &str) -> Option<ResolvedLocation> {
        for candidate in self.candidates(text).await {
            if let Some(found) = self.resolve_place(&candidate).await {
                return Some(found);
            }
        }
        debug!(target: "geo", "no location found");
        None
    }

    /// Every candidate in `text` that resolves, in extraction order.
    pub async fn resolve_all_locations(&self, text: &str) -> Vec<ResolvedLocation> {
        let mut out = Vec::new();
        for candidate in self.candidates(text).await {
            if let Some(found) = self.resolve_place(&candidate).await {
                out.push(found);
            }
        }
        out
    }

    /// Resolve a single place name: cache, then an identical lookup already in
    /// flight, then the rate-limited geocoder.
    pub async fn resolve_place(&self, place: &str) -> Option<ResolvedLocation> {
        let key = normalize_key(place);
        if key.is_empty() {
            return None;
        }

        let hit = self.cache.lock().get(&key).cloned();
        if let Some(cached) = hit {
            counter!(GEO_CACHE_HITS_TOTAL).increment(1);
            debug!(target: "geo", place = %key, found = cached.is_some(), "cache hit");
            return cached.map(|r| ResolvedLocation {
                original_text: place.to_string(),
                ..r
            });
        }

        let cell = self
            .in_flight
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let result = cell.get_or_init(|| self.lookup(&key)).await.clone();

        {
            let mut table = self.in_flight.lock();
            if table.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                table.remove(&key);
            }
        }

        result.map(|r| ResolvedLocation {
            original_text: place.to_string(),
            ..r
        })
    }

    async fn lookup(&self, key: &str) -> Option<ResolvedLocation> {
        // A lookup that finished between our cache miss and joining the table.
        let hit = self.cache.lock().get(key).cloned();
        if let Some(cached) = hit {
            return cached;
        }

        self.queue.acquire().await;
        counter!(GEO_CALLS_TOTAL).increment(1);
        let outcome =
            tokio::time::timeout(self.config.request_timeout(), self.geocoder.geocode(key)).await;

        let resolved = match outcome {
            Ok(Ok(matches)) => matches
                .into_iter()
                .find(|m| GeoPoint::new(m.lat, m.lon).is_valid())
                .map(|m| ResolvedLocation::from_match(key, m)),
            Ok(Err(e)) => {
                counter!(GEO_ERRORS_TOTAL).increment(1);
                warn!(target: "geo", geocoder = self.geocoder.name(), place = %key, error = %format!("{e:#}"), "geocode failed");
                None
            }
            Err(_) => {
                counter!(GEO_ERRORS_TOTAL).increment(1);
                warn!(
                    target: "geo",
                    geocoder = self.geocoder.name(),
                    place = %key,
                    timeout_secs = self.config.request_timeout_secs,
                    "geocode timed out"
                );
                None
            }
        };

        debug!(target: "geo", place = %key, found = resolved.is_some(), "geocoded");
        self.cache.lock().insert(key.to_string(), resolved.clone());
        resolved
    }

    async fn candidates(&self, text: &str) -> Vec<String> {
        match self.extractor.extract_places(text).await {
            Ok(raw) => filter_candidates(
                raw,
                self.config.max_candidates,
                self.config.min_candidate_len,
            ),
            Err(e) => {
                warn!(target: "geo", error = %format!("{e:#}"), "place extraction failed");
                Vec::new()
            }
        }
    }

    /// Drop expired cache entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.cache.lock().purge_expired()
    }

    /// Cached entries, negatives included, expired-but-unpurged included.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
