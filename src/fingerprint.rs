//! Stable content fingerprint used for cross-feed deduplication.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::ingest::types::Event;

/// Coordinates are compared at 4 decimal places (~11 m).
const COORD_SCALE: f64 = 10_000.0;

fn quantize(coord: f64) -> i64 {
    // `as` saturates, and -0.0 rounds to 0, so tiny negatives agree with zero.
    (coord * COORD_SCALE).round() as i64
}

/// Compute the fingerprint of an event.
///
/// Key components: source + title + source URL + lat/lon rounded to 4 decimals.
/// Timestamp, description and metadata are not part of the key.
pub fn compute(event: &Event) -> String {
    let canonical = serde_json::json!([
        event.source,
        event.title,
        event.source_url.as_deref().unwrap_or(""),
        quantize(event.location.lat),
        quantize(event.location.lon),
    ]);

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
