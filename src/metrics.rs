//! Metric names and one-time descriptions. Recording is a no-op until the host
//! process installs a recorder.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

pub const ACCEPTED_TOTAL: &str = "aggregate_accepted_total";
pub const DUPLICATES_TOTAL: &str = "aggregate_duplicates_total";
pub const EVICTED_TOTAL: &str = "aggregate_evicted_total";
pub const ADAPTER_ERRORS_TOTAL: &str = "aggregate_adapter_errors_total";
pub const CACHE_POINTS: &str = "aggregate_cache_points";
pub const FETCH_MS: &str = "aggregate_fetch_ms";

pub const GEO_CACHE_HITS_TOTAL: &str = "geo_cache_hits_total";
pub const GEO_CALLS_TOTAL: &str = "geo_geocoder_calls_total";
pub const GEO_ERRORS_TOTAL: &str = "geo_geocoder_errors_total";

/// One-time metrics registration (so series show up on scrape).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(ACCEPTED_TOTAL, "Events accepted into the cache.");
        describe_counter!(
            DUPLICATES_TOTAL,
            "Events rejected because their fingerprint was already cached."
        );
        describe_counter!(
            EVICTED_TOTAL,
            "Events evicted by per-source or global capacity pressure."
        );
        describe_counter!(ADAPTER_ERRORS_TOTAL, "Adapter fetch failures and timeouts.");
        describe_gauge!(CACHE_POINTS, "Events currently held in the merged cache.");
        describe_histogram!(FETCH_MS, "Adapter fetch time in milliseconds.");
        describe_counter!(GEO_CACHE_HITS_TOTAL, "Place lookups served from the TTL cache.");
        describe_counter!(GEO_CALLS_TOTAL, "External geocoder calls dispatched.");
        describe_counter!(
            GEO_ERRORS_TOTAL,
            "Geocoder failures and timeouts (cached as negative)."
        );
    });
}
