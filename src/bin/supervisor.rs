// =============================================================================
// Tidepool Supervisor — fleet entry point
// =============================================================================

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tidepool::coordination::redis::RedisStore;
use tidepool::supervisor::{run_supervisor, ProcessSpawner};

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("tidepool supervisor starting");

    let redis_url = std::env::var("TIDEPOOL_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let store = match RedisStore::connect(&redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "cannot reach the coordination store");
            std::process::exit(1);
        }
    };

    match run_supervisor(store, Arc::new(ProcessSpawner)).await {
        Ok(()) => info!("supervisor exited cleanly"),
        Err(e) => {
            error!(error = %e, "supervisor exiting on fatal error");
            std::process::exit(1);
        }
    }
}
