// =============================================================================
// Tidepool Worker — one pair, one process
// =============================================================================
//
// Usage: tidepool-worker <pair-id>   (or TIDEPOOL_PAIR_ID in the env)
//
// Exits non-zero when the pair id is missing, the signing key is absent
// (outside read-only mode), the worker lock is taken, or a fatal error
// escapes the scheduler.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tidepool::coordination::redis::RedisStore;
use tidepool::events::EventSink;
use tidepool::venues::http::{HttpMarketFeed, HttpSnapshotFeed};
use tidepool::worker::{run_worker, WorkerDeps};

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let pair_id = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TIDEPOOL_PAIR_ID").ok())
    {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            error!("no pair id: pass it as the first argument or set TIDEPOOL_PAIR_ID");
            std::process::exit(1);
        }
    };
    info!(pair = %pair_id, "tidepool worker starting");

    let signer_present = match std::env::var("TIDEPOOL_SIGNER_KEY") {
        Ok(key) if !key.trim().is_empty() => true,
        _ => {
            if std::env::var("TIDEPOOL_READ_ONLY").is_ok() {
                warn!("read-only mode: decisions will be computed but never executed");
                false
            } else {
                error!("TIDEPOOL_SIGNER_KEY is not set (set TIDEPOOL_READ_ONLY=1 to run without)");
                std::process::exit(1);
            }
        }
    };

    let redis_url = std::env::var("TIDEPOOL_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let data_url = std::env::var("TIDEPOOL_DATA_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

    let store = match RedisStore::connect(&redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot reach the coordination store");
            std::process::exit(1);
        }
    };

    let deps = WorkerDeps {
        store: store.clone(),
        sink: EventSink::new(store.clone()),
        market: Arc::new(HttpMarketFeed::new(data_url.as_str())),
        snapshots: Arc::new(HttpSnapshotFeed::new(data_url.as_str())),
        // Chain gateways are deployment-specific; wire one here to enable
        // on-chain execution.
        gateway: None,
        signer_present,
    };

    match run_worker(&pair_id, deps).await {
        Ok(()) => info!(pair = %pair_id, "worker exited cleanly"),
        Err(e) => {
            error!(pair = %pair_id, error = %e, "worker exiting on fatal error");
            std::process::exit(1);
        }
    }
}
