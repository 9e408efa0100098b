// =============================================================================
// Worker — one OS process serving one pair
// =============================================================================
//
// Lifecycle:
//   1. resolve the pair's configuration (store first, env seed fallback)
//   2. take the worker lock (15-minute TTL, longer than the longest bridge)
//   3. register the runtime locally, install signal + control listeners
//   4. heartbeat every 15 s: liveness key (45 s TTL), check-and-set lock
//      refresh, and the published WorkerState
//   5. run the scheduler loop until SHUTDOWN / RESTART / signal
//
// A worker that notices it no longer owns its lock shuts itself down at
// once — two processes driving the same pair is the one failure mode this
// file exists to prevent.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{pairs_from_env, PairConfig};
use crate::coordination::{keys, set_json, ControlMessage, DistributedLock, Store};
use crate::events::EventSink;
use crate::executor::Executor;
use crate::scheduler::{RuntimeSnapshot, Scheduler, SharedSnapshot};
use crate::types::{now_ms, WorkerState, WorkerStatus};
use crate::venues::{MarketFeed, SnapshotFeed, VenueGateway};

/// Heartbeat cadence and key TTL (3x the cadence tolerates one miss).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TTL: Duration = Duration::from_secs(45);
/// Worker lock TTL, sized above the longest bridge + transaction sequence.
const WORKER_LOCK_TTL: Duration = Duration::from_secs(15 * 60);
/// Back-off between control-channel reconnect attempts.
const SUBSCRIBER_BACKOFF: Duration = Duration::from_secs(15);
/// Lifetime of the "restarting" marker the supervisor reads.
const RESTARTING_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Local registry
// ---------------------------------------------------------------------------

/// Process-local registry of pair runtimes (one entry in a worker process;
/// shared tooling iterates it).
static REGISTRY: OnceLock<Mutex<HashMap<String, SharedSnapshot>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, SharedSnapshot>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn registered_pairs() -> Vec<String> {
    registry().lock().keys().cloned().collect()
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Everything a worker needs besides its pair id.
pub struct WorkerDeps {
    pub store: Store,
    pub sink: EventSink,
    pub market: Arc<dyn MarketFeed>,
    pub snapshots: Arc<dyn SnapshotFeed>,
    pub gateway: Option<Arc<dyn VenueGateway>>,
    /// True when a signing key is configured; without it decisions are
    /// computed and published but never executed.
    pub signer_present: bool,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one worker to completion. An `Err` return means the process should
/// exit non-zero.
pub async fn run_worker(pair_id: &str, deps: WorkerDeps) -> Result<()> {
    // --- 1. Configuration ----------------------------------------------------
    let pair = resolve_config(&deps.store, pair_id)
        .await
        .with_context(|| format!("no usable configuration for pair {pair_id}"))?;
    pair.validate()?;

    // --- 2. Lock -------------------------------------------------------------
    let lock = Arc::new(DistributedLock::new(
        deps.store.clone(),
        keys::worker_lock(&pair.id),
        WORKER_LOCK_TTL,
    ));
    if !lock.acquire().await.context("acquiring worker lock")? {
        bail!("worker lock for {} is held by another process", pair.id);
    }
    info!(pair = %pair.id, holder = %lock.holder(), "worker lock acquired");

    // --- 3. Runtime registration & channels ---------------------------------
    let shared: SharedSnapshot = Arc::new(RwLock::new(RuntimeSnapshot::default()));
    registry().lock().insert(pair.id.clone(), shared.clone());

    let start = Instant::now();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let restart_requested = Arc::new(AtomicBool::new(false));

    // OS signals translate into the same shutdown path as a control message.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; shutting worker down");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // Control-channel subscriber, reconnecting with a fixed back-off.
    let control_task = tokio::spawn(control_listener(
        deps.store.clone(),
        pair.id.clone(),
        shutdown_tx.clone(),
        shutdown_rx.clone(),
        restart_requested.clone(),
    ));

    // --- 4. Heartbeat --------------------------------------------------------
    let heartbeat_task = tokio::spawn(heartbeat_loop(
        deps.store.clone(),
        lock.clone(),
        pair.id.clone(),
        shared.clone(),
        start,
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));

    // --- 5. Scheduler --------------------------------------------------------
    let executor = if deps.signer_present {
        deps.gateway.clone().map(|gw| {
            Executor::new(
                pair.id.clone(),
                gw,
                deps.store.clone(),
                deps.sink.clone(),
            )
        })
    } else {
        None
    };

    let mut scheduler = Scheduler::new(
        pair.clone(),
        deps.store.clone(),
        deps.sink.clone(),
        deps.market.clone(),
        deps.snapshots.clone(),
        deps.gateway.clone(),
        executor,
        shared.clone(),
    );

    let result = async {
        scheduler.bootstrap().await.context("restoring scheduler state")?;
        scheduler.run_loop(shutdown_rx.clone()).await;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // --- Teardown ------------------------------------------------------------
    let _ = shutdown_tx.send(true);
    heartbeat_task.abort();
    control_task.abort();

    let (status, error_msg) = match &result {
        Ok(()) => (WorkerStatus::Stopped, None),
        Err(e) => (WorkerStatus::Error, Some(format!("{e:#}"))),
    };
    publish_state(&deps.store, &pair.id, &shared, start, status, error_msg.clone()).await;

    deps.sink.flush().await;
    let _ = deps.store.del(&keys::worker_heartbeat(&pair.id)).await;

    if restart_requested.load(Ordering::SeqCst) {
        // Tells the supervisor to skip its back-off on the coming exit.
        let _ = deps
            .store
            .set(
                &keys::worker_restarting(&pair.id),
                "1",
                Some(RESTARTING_TTL),
                false,
            )
            .await;
    }

    if let Err(released) = lock.release().await {
        warn!(pair = %pair.id, error = %released, "lock release failed");
    }
    registry().lock().remove(&pair.id);

    match result {
        Ok(()) => {
            info!(pair = %pair.id, "worker stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(pair = %pair.id, error = %e, "worker terminating on fatal error");
            Err(e)
        }
    }
}

/// Store-first configuration lookup with the env seed as fallback.
async fn resolve_config(store: &Store, pair_id: &str) -> Result<PairConfig> {
    if let Some(raw) = store.hget(keys::PAIR_CONFIGS, pair_id).await? {
        let cfg: PairConfig =
            serde_json::from_str(&raw).context("stored pair config is malformed")?;
        return Ok(cfg);
    }
    let seeded = pairs_from_env()?;
    seeded
        .into_iter()
        .find(|c| c.id == pair_id)
        .with_context(|| format!("pair {pair_id} not present in store or env seed"))
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

async fn heartbeat_loop(
    store: Store,
    lock: Arc<DistributedLock>,
    pair_id: String,
    shared: SharedSnapshot,
    start: Instant,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        // (a) liveness key with TTL
        if let Err(e) = store
            .set(
                &keys::worker_heartbeat(&pair_id),
                &now_ms().to_string(),
                Some(HEARTBEAT_TTL),
                false,
            )
            .await
        {
            warn!(pair = %pair_id, error = %e, "heartbeat write failed");
        }

        // (b) lock refresh under check-and-set; losing it is fatal
        match lock.refresh().await {
            Ok(true) => {}
            Ok(false) => {
                error!(pair = %pair_id, "worker lock lost; shutting down to avoid split-brain");
                let _ = shutdown_tx.send(true);
                return;
            }
            Err(e) => warn!(pair = %pair_id, error = %e, "lock refresh errored"),
        }

        // (c) published state
        publish_state(&store, &pair_id, &shared, start, WorkerStatus::Running, None).await;

        tokio::select! {
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn publish_state(
    store: &Store,
    pair_id: &str,
    shared: &SharedSnapshot,
    start: Instant,
    status: WorkerStatus,
    error_msg: Option<String>,
) {
    let snapshot = shared.read().clone();
    let state = WorkerState {
        pair_id: pair_id.to_string(),
        pid: std::process::id(),
        status,
        uptime_ms: start.elapsed().as_millis() as u64,
        error_msg,
        epoch: snapshot.epoch,
        current_apr: snapshot.current_apr,
        optimal_apr: snapshot.optimal_apr,
        last_decision: snapshot.last_decision,
        last_decision_ts: snapshot.last_decision_ts,
    };
    if let Err(e) = set_json(store.as_ref(), &keys::worker_state(pair_id), &state, None).await {
        warn!(pair = %pair_id, error = %e, "state publish failed");
    }
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

async fn control_listener(
    store: Store,
    pair_id: String,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    restart_requested: Arc<AtomicBool>,
) {
    loop {
        match store.subscribe(keys::CONTROL_CHANNEL).await {
            Ok(mut rx) => {
                info!(pair = %pair_id, "control channel subscribed");
                loop {
                    tokio::select! {
                        msg = rx.recv() => {
                            let Some(raw) = msg else { break }; // reconnect
                            let Some(parsed) = ControlMessage::parse(&raw) else {
                                continue; // malformed messages are ignored
                            };
                            if !parsed.targets(&pair_id) {
                                continue;
                            }
                            match parsed {
                                ControlMessage::Shutdown { .. } => {
                                    info!(pair = %pair_id, "SHUTDOWN received");
                                    let _ = shutdown_tx.send(true);
                                    return;
                                }
                                ControlMessage::Restart { .. } => {
                                    info!(pair = %pair_id, "RESTART received");
                                    restart_requested.store(true, Ordering::SeqCst);
                                    let _ = shutdown_tx.send(true);
                                    return;
                                }
                                // Config reconciliation is the supervisor's job.
                                ControlMessage::ConfigChanged => {}
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(pair = %pair_id, error = %e, "control subscribe failed; retrying");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(SUBSCRIBER_BACKOFF) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}
