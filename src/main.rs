//! Geo Event Aggregator: binary entrypoint.
//! Loads config, wires the location resolver and file-backed sources into the
//! aggregation engine, does one full fetch, then keeps every source refreshing
//! and logs change notifications until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use geo_event_aggregator::geo::NominatimGeocoder;
use geo_event_aggregator::ingest::scheduler::spawn_refresh_tasks;
use geo_event_aggregator::{Aggregator, AppConfig, FileFeedAdapter, LocationResolver};

/// `RUST_LOG` wins; otherwise info for this crate, warn elsewhere.
/// `LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("geo_event_aggregator=info,warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading configuration")?;

    let geocoder = NominatimGeocoder::new(&cfg.geocoder, cfg.resolver.request_timeout())?;
    let resolver = Arc::new(LocationResolver::with_defaults(
        cfg.resolver.clone(),
        Arc::new(geocoder),
    ));

    let aggregator = Aggregator::new(cfg.aggregator.clone());
    for src in &cfg.sources {
        let adapter = FileFeedAdapter::from_path(src.name.clone(), src.path.clone())
            .refresh_every(std::time::Duration::from_secs(src.refresh_secs))
            .enabled(src.enabled)
            .resolve_budget(cfg.aggregator.fetch_timeout() * 2 / 3)
            .with_resolver(resolver.clone());
        aggregator.register_source(Arc::new(adapter));
    }
    if cfg.sources.is_empty() {
        warn!("no sources configured; nothing will be ingested");
    }

    let mut updates = aggregator.subscribe();

    let initial = aggregator.fetch_all().await;
    info!(total = initial.len(), "initial fetch complete");

    let refreshers = spawn_refresh_tasks(&aggregator);

    loop {
        tokio::select! {
            msg = updates.recv() => match msg {
                Ok(n) => info!(
                    source = %n.source,
                    new = n.events.len(),
                    total = n.total_count,
                    "cache updated"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notification subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    for task in refreshers {
        task.abort();
    }
    let stats = aggregator.get_cache_stats();
    info!(
        total = stats.total_points,
        purged_geo = resolver.purge_expired(),
        "stopped"
    );
    Ok(())
}
