//! Change notifications and the streaming hand-off given to adapters.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Aggregator;
use crate::ingest::types::Event;

/// Published once per accepted batch, or once per accepted streamed event.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeNotification {
    pub source: String,
    pub events: Vec<Event>,
    /// Cache size after the change was applied.
    pub total_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Handle an adapter uses to push single events while its batch fetch is in flight.
#[derive(Clone)]
pub struct StreamSink {
    aggregator: Aggregator,
    source: String,
}

impl StreamSink {
    pub(crate) fn new(aggregator: Aggregator, source: impl Into<String>) -> Self {
        Self {
            aggregator,
            source: source.into(),
        }
    }

    /// Returns `true` if the event was accepted, `false` for a duplicate.
    pub fn push(&self, event: Event) -> bool {
        self.aggregator.ingest_single(&self.source, event)
    }
}
