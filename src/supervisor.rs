// =============================================================================
// Supervisor — singleton process managing the worker fleet
// =============================================================================
//
// Holds the supervisor singleton lock (60 s TTL, refreshed every health
// tick), owns the configuration key space and the worker-id set, and runs
// one child process per configured pair.
//
// Health loop, every 10 seconds:
//   - refresh the lock first; losing it means another supervisor took over
//     and this one must leave
//   - detect exited children; a child that exited with the "restarting"
//     marker respawns immediately, anything else waits out an exponential
//     back-off (10 s doubling, capped at 5 minutes, 20 failures max)
//   - a live child whose heartbeat key has been missing for longer than
//     twice the heartbeat timeout past spawn is killed and respawned by the
//     next tick's exit path
//
// Reconciliation (CONFIG_CHANGED or SIGHUP) diffs the stored configuration
// against the running fleet: removed pairs are stopped and their keys
// cleared, changed pairs are restarted exactly once, new pairs are spawned.
// Concurrent triggers coalesce onto the single in-flight run.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{pairs_from_env, PairConfig};
use crate::coordination::{keys, ControlMessage, DistributedLock, Store};

/// Supervisor lock TTL, double the health-loop cadence.
const SUPERVISOR_LOCK_TTL: Duration = Duration::from_secs(60);
/// Health loop cadence.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
/// First respawn back-off; doubles per consecutive failure.
const BACKOFF_BASE: Duration = Duration::from_secs(10);
/// Back-off ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(300);
/// Failure counter ceiling.
const FAILURE_CAP: u32 = 20;
/// Worker heartbeat TTL; a live child missing its heartbeat for twice this
/// span past spawn is presumed wedged.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);
/// Grace period for children to exit on a broadcast SHUTDOWN.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// Poll cadence while waiting for children to exit.
const EXIT_POLL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Spawner seam
// ---------------------------------------------------------------------------

/// A handle to one spawned worker child.
pub trait ChildHandle: Send {
    /// Non-blocking exit probe.
    fn try_exited(&mut self) -> Option<i32>;
    /// Best-effort kill.
    fn kill(&mut self);
    fn pid(&self) -> Option<u32>;
}

/// Launches worker processes. The production implementation execs the
/// worker binary; tests script exits and hangs.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, pair_id: &str) -> Result<Box<dyn ChildHandle>>;
}

/// Production spawner: runs `tidepool-worker <pair-id>` from the supervisor's
/// own directory (override with `TIDEPOOL_WORKER_BIN`).
pub struct ProcessSpawner;

struct ProcessChild(tokio::process::Child);

impl ChildHandle for ProcessChild {
    fn try_exited(&mut self) -> Option<i32> {
        match self.0.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(_) => Some(-1),
        }
    }

    fn kill(&mut self) {
        let _ = self.0.start_kill();
    }

    fn pid(&self) -> Option<u32> {
        self.0.id()
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, pair_id: &str) -> Result<Box<dyn ChildHandle>> {
        let binary = match std::env::var("TIDEPOOL_WORKER_BIN") {
            Ok(path) => std::path::PathBuf::from(path),
            Err(_) => {
                let mut path = std::env::current_exe().context("locating supervisor binary")?;
                path.set_file_name("tidepool-worker");
                path
            }
        };
        let child = tokio::process::Command::new(&binary)
            .arg(pair_id)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning worker for {pair_id} from {binary:?}"))?;
        info!(pair = %pair_id, pid = child.id(), "worker spawned");
        Ok(Box::new(ProcessChild(child)))
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct ManagedWorker {
    config_raw: String,
    child: Option<Box<dyn ChildHandle>>,
    spawned_at: Instant,
    failures: u32,
    backoff_until: Option<Instant>,
}

/// The supervisor state machine. Driven by `run_supervisor` in production;
/// tests call `health_tick` and `reconcile` directly.
pub struct Supervisor {
    store: Store,
    spawner: Arc<dyn WorkerSpawner>,
    lock: DistributedLock,
    workers: HashMap<String, ManagedWorker>,
}

impl Supervisor {
    pub fn new(store: Store, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let lock = DistributedLock::new(store.clone(), keys::SUPERVISOR_LOCK, SUPERVISOR_LOCK_TTL);
        Self {
            store,
            spawner,
            lock,
            workers: HashMap::new(),
        }
    }

    /// Acquire the singleton lock. Failure means another supervisor runs.
    pub async fn acquire_lock(&self) -> Result<()> {
        if !self.lock.acquire().await.context("acquiring supervisor lock")? {
            bail!("supervisor lock is held by another process");
        }
        info!(holder = %self.lock.holder(), "supervisor lock acquired");
        Ok(())
    }

    /// Load pair configuration from the store, seeding from the environment
    /// (and persisting the seed) when the store is empty.
    pub async fn load_or_seed_configs(&self) -> Result<Vec<PairConfig>> {
        let stored = self.store.hgetall(keys::PAIR_CONFIGS).await?;
        if !stored.is_empty() {
            let mut configs = Vec::new();
            for (id, raw) in stored {
                match serde_json::from_str::<PairConfig>(&raw) {
                    Ok(cfg) if cfg.validate().is_ok() => configs.push(cfg),
                    Ok(cfg) => warn!(pair = %cfg.id, "invalid stored pair config skipped"),
                    Err(e) => warn!(pair = %id, error = %e, "malformed stored pair config skipped"),
                }
            }
            return Ok(configs);
        }

        let seeded = pairs_from_env().context("store empty and env seed unavailable")?;
        if seeded.is_empty() {
            bail!("no valid pair configuration found");
        }
        for cfg in &seeded {
            self.store
                .hset(keys::PAIR_CONFIGS, &cfg.id, &serde_json::to_string(cfg)?)
                .await?;
        }
        info!(count = seeded.len(), "pair configuration seeded into the store");
        Ok(seeded)
    }

    /// Register the current pair-id set and spawn one worker per pair.
    pub async fn spawn_all(&mut self, configs: Vec<PairConfig>) -> Result<()> {
        for cfg in configs {
            self.store.sadd(keys::WORKERS_SET, &cfg.id).await?;
            self.spawn_pair(&cfg).await;
        }
        Ok(())
    }

    async fn spawn_pair(&mut self, cfg: &PairConfig) {
        let raw = serde_json::to_string(cfg).unwrap_or_default();
        match self.spawner.spawn(&cfg.id).await {
            Ok(child) => {
                self.workers.insert(
                    cfg.id.clone(),
                    ManagedWorker {
                        config_raw: raw,
                        child: Some(child),
                        spawned_at: Instant::now(),
                        failures: 0,
                        backoff_until: None,
                    },
                );
            }
            Err(e) => {
                error!(pair = %cfg.id, error = %e, "worker spawn failed");
                // Treat like an immediate exit: back-off drives the retry.
                self.workers.insert(
                    cfg.id.clone(),
                    ManagedWorker {
                        config_raw: raw,
                        child: None,
                        spawned_at: Instant::now(),
                        failures: 1,
                        backoff_until: Some(Instant::now() + BACKOFF_BASE),
                    },
                );
            }
        }
    }

    async fn respawn(&mut self, pair_id: &str) {
        match self.spawner.spawn(pair_id).await {
            Ok(child) => {
                if let Some(worker) = self.workers.get_mut(pair_id) {
                    worker.child = Some(child);
                    worker.spawned_at = Instant::now();
                    worker.backoff_until = None;
                }
            }
            Err(e) => {
                error!(pair = %pair_id, error = %e, "respawn failed");
                if let Some(worker) = self.workers.get_mut(pair_id) {
                    worker.failures = (worker.failures + 1).min(FAILURE_CAP);
                    worker.backoff_until = Some(Instant::now() + backoff_for(worker.failures));
                }
            }
        }
    }

    // =========================================================================
    // Health loop
    // =========================================================================

    /// One health tick. Returns `Err` only on lock loss, which is fatal.
    pub async fn health_tick(&mut self) -> Result<()> {
        // Lock first: a supervisor that cannot prove ownership must leave.
        match self.lock.refresh().await {
            Ok(true) => {}
            Ok(false) => bail!("supervisor lock lost"),
            Err(e) => warn!(error = %e, "supervisor lock refresh errored"),
        }

        let pair_ids: Vec<String> = self.workers.keys().cloned().collect();
        for pair_id in pair_ids {
            self.check_worker(&pair_id).await;
        }
        Ok(())
    }

    async fn check_worker(&mut self, pair_id: &str) {
        let now = Instant::now();

        enum Probe {
            Exited(i32),
            Alive,
            BackoffElapsed,
            BackoffPending,
        }

        let probe = {
            let Some(worker) = self.workers.get_mut(pair_id) else {
                return;
            };
            match &mut worker.child {
                Some(child) => match child.try_exited() {
                    Some(code) => Probe::Exited(code),
                    None => Probe::Alive,
                },
                None => {
                    if worker.backoff_until.map_or(true, |t| now >= t) {
                        Probe::BackoffElapsed
                    } else {
                        Probe::BackoffPending
                    }
                }
            }
        };

        match probe {
            Probe::BackoffPending => {}
            Probe::BackoffElapsed => {
                // Waiting on back-off; the deadline has passed.
                self.respawn_after_backoff(pair_id).await;
            }
            Probe::Exited(code) => {
                let restarting_key = keys::worker_restarting(pair_id);
                let restarting = self.store.exists(&restarting_key).await.unwrap_or(false);
                let worker = self.workers.get_mut(pair_id).expect("worker present");
                worker.child = None;

                if restarting {
                    // Deliberate restart: no back-off, clean slate.
                    let _ = self.store.del(&restarting_key).await;
                    let worker = self.workers.get_mut(pair_id).expect("worker present");
                    worker.failures = 0;
                    worker.backoff_until = None;
                    info!(pair = %pair_id, "worker restarting on request");
                    self.respawn(pair_id).await;
                } else {
                    let worker = self.workers.get_mut(pair_id).expect("worker present");
                    worker.failures = (worker.failures + 1).min(FAILURE_CAP);
                    let backoff = backoff_for(worker.failures);
                    worker.backoff_until = Some(now + backoff);
                    warn!(
                        pair = %pair_id,
                        exit_code = code,
                        failures = worker.failures,
                        backoff_secs = backoff.as_secs(),
                        "worker exited; respawn scheduled"
                    );
                }
            }
            Probe::Alive => {
                // Judge the heartbeat.
                let hb_alive = self
                    .store
                    .exists(&keys::worker_heartbeat(pair_id))
                    .await
                    .unwrap_or(false);
                let worker = self.workers.get_mut(pair_id).expect("worker present");
                if hb_alive {
                    worker.failures = 0;
                    worker.backoff_until = None;
                } else if now.duration_since(worker.spawned_at) > 2 * HEARTBEAT_TIMEOUT {
                    warn!(pair = %pair_id, "live child without heartbeat; killing");
                    if let Some(child) = &mut worker.child {
                        child.kill();
                    }
                    // The next tick's exit path schedules the respawn.
                }
            }
        }
    }

    async fn respawn_after_backoff(&mut self, pair_id: &str) {
        info!(pair = %pair_id, "back-off elapsed; respawning worker");
        self.respawn(pair_id).await;
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Diff stored configuration against the running fleet: stop removed
    /// pairs, restart changed pairs, spawn added pairs.
    pub async fn reconcile(&mut self) -> Result<()> {
        let stored = self.store.hgetall(keys::PAIR_CONFIGS).await?;
        let mut desired: HashMap<String, (PairConfig, String)> = HashMap::new();
        for (id, raw) in stored {
            match serde_json::from_str::<PairConfig>(&raw) {
                Ok(cfg) if cfg.validate().is_ok() => {
                    desired.insert(id, (cfg, raw));
                }
                _ => warn!(pair = %id, "invalid pair config ignored during reconcile"),
            }
        }

        // Removed pairs: stop and clear their key space.
        let removed: Vec<String> = self
            .workers
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for pair_id in removed {
            info!(pair = %pair_id, "pair removed from configuration; stopping worker");
            self.stop_worker(&pair_id).await;
            for key in keys::pair_scoped(&pair_id) {
                let _ = self.store.del(&key).await;
            }
            let _ = self.store.srem(keys::WORKERS_SET, &pair_id).await;
            self.workers.remove(&pair_id);
        }

        // Changed and added pairs.
        for (pair_id, (cfg, raw)) in desired {
            match self.workers.get(&pair_id) {
                Some(worker) if worker.config_raw == raw => {}
                Some(_) => {
                    info!(pair = %pair_id, "pair configuration changed; restarting worker");
                    self.stop_worker(&pair_id).await;
                    self.workers.remove(&pair_id);
                    self.spawn_pair(&cfg).await;
                }
                None => {
                    info!(pair = %pair_id, "new pair configured; spawning worker");
                    let _ = self.store.sadd(keys::WORKERS_SET, &pair_id).await;
                    self.spawn_pair(&cfg).await;
                }
            }
        }
        Ok(())
    }

    /// Stop one worker: targeted SHUTDOWN, bounded wait, then force-kill.
    async fn stop_worker(&mut self, pair_id: &str) {
        let msg = serde_json::to_string(&ControlMessage::Shutdown {
            pair_id: Some(pair_id.to_string()),
        })
        .expect("control message serializes");
        let _ = self.store.publish(keys::CONTROL_CHANNEL, &msg).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let Some(worker) = self.workers.get_mut(pair_id) else {
                return;
            };
            let Some(child) = &mut worker.child else {
                return;
            };
            if child.try_exited().is_some() {
                worker.child = None;
                return;
            }
            if Instant::now() >= deadline {
                child.kill();
                worker.child = None;
                return;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Broadcast SHUTDOWN, wait out the shared grace deadline, force-kill
    /// stragglers, release the lock.
    pub async fn shutdown(&mut self) {
        info!("supervisor shutting down; broadcasting SHUTDOWN");
        let msg = serde_json::to_string(&ControlMessage::Shutdown { pair_id: None })
            .expect("control message serializes");
        let _ = self.store.publish(keys::CONTROL_CHANNEL, &msg).await;

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let all_gone = self
                .workers
                .values_mut()
                .all(|w| match &mut w.child {
                    Some(child) => child.try_exited().is_some(),
                    None => true,
                });
            if all_gone {
                break;
            }
            if Instant::now() >= deadline {
                for (pair_id, worker) in self.workers.iter_mut() {
                    if let Some(child) = &mut worker.child {
                        if child.try_exited().is_none() {
                            warn!(pair = %pair_id, "force-killing worker past grace deadline");
                            child.kill();
                        }
                    }
                }
                break;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "supervisor lock release failed");
        }
        info!("supervisor shut down");
    }

    #[cfg(test)]
    fn worker(&self, pair_id: &str) -> &ManagedWorker {
        &self.workers[pair_id]
    }

    #[cfg(test)]
    fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// Exponential back-off for the nth consecutive failure: 10 s, 20 s, 40 s,
/// ... capped at 5 minutes.
fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    let raw = BACKOFF_BASE.saturating_mul(1u32 << exp.min(5));
    // Beyond 2^5 the doubling already exceeds the cap.
    if exp > 5 {
        BACKOFF_CAP
    } else {
        raw.min(BACKOFF_CAP)
    }
}

// ---------------------------------------------------------------------------
// Production driver
// ---------------------------------------------------------------------------

/// Full supervisor lifecycle: lock, config, control subscription, fleet
/// spawn, health loop. Returns `Err` for non-zero process exit.
pub async fn run_supervisor(store: Store, spawner: Arc<dyn WorkerSpawner>) -> Result<()> {
    let mut supervisor = Supervisor::new(store.clone(), spawner);
    supervisor.acquire_lock().await?;

    let configs = supervisor.load_or_seed_configs().await?;

    // Read-only API surface.
    {
        let store = store.clone();
        let addr =
            std::env::var("TIDEPOOL_API_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
        tokio::spawn(async move {
            if let Err(e) = crate::api::serve(store, &addr).await {
                error!(error = %e, "read API failed");
            }
        });
    }

    // Subscribe before spawning so no config-change message is lost.
    let (reconcile_tx, mut reconcile_rx) = mpsc::channel::<()>(8);
    {
        let store = store.clone();
        let reconcile_tx = reconcile_tx.clone();
        tokio::spawn(async move {
            loop {
                match store.subscribe(keys::CONTROL_CHANNEL).await {
                    Ok(mut rx) => {
                        while let Some(raw) = rx.recv().await {
                            if let Some(ControlMessage::ConfigChanged) = ControlMessage::parse(&raw)
                            {
                                let _ = reconcile_tx.try_send(());
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "supervisor control subscribe failed"),
                }
                tokio::time::sleep(Duration::from_secs(15)).await;
            }
        });
    }

    // SIGHUP also triggers reconciliation.
    #[cfg(unix)]
    {
        let reconcile_tx = reconcile_tx.clone();
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hup.recv().await.is_some() {
                info!("SIGHUP received; scheduling reconcile");
                let _ = reconcile_tx.try_send(());
            }
        });
    }

    supervisor.spawn_all(configs).await?;

    let mut health = tokio::time::interval(HEALTH_INTERVAL);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            _ = health.tick() => {
                if let Err(e) = supervisor.health_tick().await {
                    error!(error = %e, "health loop fatal");
                    break Err(e);
                }
            }
            triggered = reconcile_rx.recv() => {
                if triggered.is_some() {
                    // Drain queued triggers: concurrent requests coalesce.
                    while reconcile_rx.try_recv().is_ok() {}
                    if let Err(e) = supervisor.reconcile().await {
                        warn!(error = %e, "reconcile failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break Ok(());
            }
        }
    };

    supervisor.shutdown().await;
    outcome
}
