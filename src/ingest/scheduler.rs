// src/ingest/scheduler.rs
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::aggregate::Aggregator;

/// Spawn one refresh loop per registered source, each ticking at that source's
/// own refresh interval. The first tick fires after one full interval, so call
/// `fetch_all` yourself for the initial load.
pub fn spawn_refresh_tasks(aggregator: &Aggregator) -> Vec<JoinHandle<()>> {
    aggregator
        .source_names()
        .into_iter()
        .filter_map(|name| {
            let adapter = aggregator.adapter(&name)?;
            let every = adapter.refresh_interval().max(Duration::from_secs(1));
            let agg = aggregator.clone();
            Some(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + every;
                let mut ticker = tokio::time::interval_at(start, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let accepted = agg.fetch_source(&name).await;
                    tracing::debug!(target: "ingest", source = %name, accepted, "refresh tick");
                }
            }))
        })
        .collect()
}
