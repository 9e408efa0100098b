// =============================================================================
// Read API — Axum 0.7 surface over the coordination store
// =============================================================================
//
// Strictly read-only: every handler reads the store, nothing writes. The
// supervisor hosts it; workers never serve HTTP.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::coordination::{keys, CoordinationStore};
use crate::types::{Position, WorkerState};

type SharedStore = Arc<dyn CoordinationStore>;

/// Build the read-only router with CORS middleware and the store handle.
pub fn router(store: SharedStore) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/workers", get(workers))
        .route("/api/v1/workers/:pair_id", get(worker_state))
        .route("/api/v1/pairs/:pair_id/positions", get(pair_positions))
        .layer(cors)
        .with_state(store)
}

/// Bind and serve until the process exits.
pub async fn serve(store: SharedStore, addr: &str) -> anyhow::Result<()> {
    let app = router(store);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "read API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

/// All registered pairs with their latest published worker state.
async fn workers(State(store): State<SharedStore>) -> impl IntoResponse {
    let pair_ids = match store.smembers(keys::WORKERS_SET).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "worker set read failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut out = Vec::with_capacity(pair_ids.len());
    for pair_id in pair_ids {
        let state = store
            .get(&keys::worker_state(&pair_id))
            .await
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<WorkerState>(&raw).ok());
        let heartbeat_alive = store
            .exists(&keys::worker_heartbeat(&pair_id))
            .await
            .unwrap_or(false);
        out.push(json!({
            "pair_id": pair_id,
            "heartbeat_alive": heartbeat_alive,
            "state": state,
        }));
    }
    Json(json!({ "workers": out })).into_response()
}

/// One worker's published state.
async fn worker_state(
    State(store): State<SharedStore>,
    Path(pair_id): Path<String>,
) -> impl IntoResponse {
    match store.get(&keys::worker_state(&pair_id)).await {
        Ok(Some(raw)) => match serde_json::from_str::<WorkerState>(&raw) {
            Ok(state) => Json(state).into_response(),
            Err(e) => {
                warn!(pair = %pair_id, error = %e, "stored worker state is malformed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no state for pair {pair_id}") })),
        )
            .into_response(),
        Err(e) => {
            warn!(pair = %pair_id, error = %e, "worker state read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// A pair's open positions.
async fn pair_positions(
    State(store): State<SharedStore>,
    Path(pair_id): Path<String>,
) -> impl IntoResponse {
    match store.hgetall(&keys::pair_positions(&pair_id)).await {
        Ok(entries) => {
            let positions: Vec<Position> = entries
                .iter()
                .filter_map(|(_, raw)| serde_json::from_str(raw).ok())
                .collect();
            Json(json!({ "pair_id": pair_id, "positions": positions })).into_response()
        }
        Err(e) => {
            warn!(pair = %pair_id, error = %e, "positions read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryStore;
    use crate::types::{DexFamily, WorkerStatus};
    use tower::ServiceExt;

    async fn store_with_worker() -> SharedStore {
        let store: SharedStore = Arc::new(MemoryStore::new());
        store.sadd(keys::WORKERS_SET, "weth-usdc").await.unwrap();
        let state = WorkerState {
            pair_id: "weth-usdc".into(),
            pid: 1234,
            status: WorkerStatus::Running,
            uptime_ms: 60_000,
            error_msg: None,
            epoch: 7,
            current_apr: 0.11,
            optimal_apr: 0.13,
            last_decision: Some("HOLD".into()),
            last_decision_ts: 0,
        };
        store
            .set(
                &keys::worker_state("weth-usdc"),
                &serde_json::to_string(&state).unwrap(),
                None,
                false,
            )
            .await
            .unwrap();
        store
    }

    async fn get_body(
        router: Router,
        uri: &str,
    ) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let store = store_with_worker().await;
        let (status, body) = get_body(router(store), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn workers_listing() {
        let store = store_with_worker().await;
        let (status, body) = get_body(router(store), "/api/v1/workers").await;
        assert_eq!(status, StatusCode::OK);
        let workers = body["workers"].as_array().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0]["pair_id"], "weth-usdc");
        assert_eq!(workers[0]["state"]["epoch"], 7);
    }

    #[tokio::test]
    async fn worker_state_found_and_missing() {
        let store = store_with_worker().await;
        let (status, body) = get_body(router(store.clone()), "/api/v1/workers/weth-usdc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (status, _) = get_body(router(store), "/api/v1/workers/ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn positions_endpoint_skips_garbage_records() {
        let store = store_with_worker().await;
        let pos = Position {
            id: "p1".into(),
            pool_id: "0xpool".into(),
            chain: "base".into(),
            dex: DexFamily::V3,
            venue_position_id: "9".into(),
            lower_bound: -60,
            upper_bound: 60,
            liquidity: 5,
            amount0: 1,
            amount1: 2,
            entry_price: 1.0,
            entry_ts: 0,
            entry_apr: 0.1,
            entry_value_usd: 100.0,
        };
        store
            .hset(
                &keys::pair_positions("weth-usdc"),
                "p1",
                &serde_json::to_string(&pos).unwrap(),
            )
            .await
            .unwrap();
        store
            .hset(&keys::pair_positions("weth-usdc"), "junk", "not-json")
            .await
            .unwrap();

        let (status, body) =
            get_body(router(store), "/api/v1/pairs/weth-usdc/positions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["positions"].as_array().unwrap().len(), 1);
    }
}
