// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod config;
pub mod fingerprint;
pub mod geo;
pub mod ingest;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::{
    Aggregator, CacheStats, ChangeNotification, SourceStats, SourceSummary, StreamSink,
};
pub use crate::config::AppConfig;
pub use crate::geo::{LocationResolver, ResolvedLocation};
pub use crate::ingest::providers::FileFeedAdapter;
pub use crate::ingest::types::{Event, GeoPoint, SourceAdapter};
