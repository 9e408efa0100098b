// =============================================================================
// Scheduler — one pair's five-phase cycle and the loop that drives it
// =============================================================================
//
// Every epoch (default 900 s) the scheduler runs exactly one cycle:
//
//   1. FETCH    — new M1 candles and pool snapshots, in parallel
//   2. COMPUTE  — regime check, optimizer (unless suppressed), kill-switches,
//                 composite forces, per-pool analyses, water-fill allocation
//   3. DECIDE   — the pure PRA / RS / HOLD function
//   4. STORE    — pool-analysis, allocation and epoch-snapshot events
//   5. EXECUTE  — dispatch non-HOLD decisions when a signer is configured
//
// The loop is a self-rescheduled single-shot timer: the next cycle is armed
// only after the current one finishes, so cycles can never overlap, and the
// pending timer dies with the shutdown signal. A failing cycle is logged and
// the timer re-armed; it never kills the worker.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::allocator::water_fill;
use crate::config::{ForceParams, PairConfig, Thresholds};
use crate::coordination::{get_json, keys, set_json, Store};
use crate::decision::{decide, ActionKind, Decision, GasContext};
use crate::events::{streams, EventSink};
use crate::executor::{load_positions, ExecutionReport, Executor};
use crate::forces::{composite, Forces};
use crate::indicators::aggregate::{aggregate, M15_MS};
use crate::optimizer::fitness::FitnessInputs;
use crate::optimizer::kill_switch::{KillSwitchReason, KillSwitchState};
use crate::optimizer::regime::{detect, RegimeVerdict};
use crate::optimizer::{tune, WarmStart};
use crate::range::{compute_range, RangeParams};
use crate::types::{now_ms, Candle, PoolAnalysis, PoolSnapshot};
use crate::venues::{MarketFeed, SnapshotFeed, VenueGateway};

/// Candle history retained in the worker's buffer.
const HISTORY_MS: i64 = 30 * 24 * 3_600_000;
/// Minimum M1 candles before the optimizer is allowed to run.
const MIN_CANDLES_FOR_OPTIMIZER: usize = 100;
/// Minimum M1 candles before composite forces replace the neutral triple.
const MIN_CANDLES_FOR_FORCES: usize = 10;
/// Capital assumed when the book is empty, USD.
const DEFAULT_CAPITAL_USD: f64 = 10_000.0;
/// Gas estimate used when no gateway is available to ask, USD.
const DEFAULT_GAS_USD: f64 = 2.0;
/// TVL of a pool is assumed spread over this relative price width when
/// estimating how much of it competes inside a candidate interval.
const DEPTH_REFERENCE_WIDTH: f64 = 1.0;

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Worker-local mutable state for one pair.
pub struct PairRuntime {
    /// Trailing 30 days of M1 bars, oldest first.
    pub candles: Vec<Candle>,
    /// Timestamp of the newest fetched bar.
    pub candle_cursor: i64,
    pub epoch: u64,
    /// Epoch until which the optimizer stays suppressed.
    pub suppress_until_epoch: u64,
    /// Parameters in force this cycle (optimized, widened, or defaults).
    pub params: RangeParams,
    pub warm_start: Option<[f64; 5]>,
    pub kill_state: KillSwitchState,
    pub last_forces: Option<Forces>,
    pub last_decision: Option<Decision>,
    pub last_regime: Option<RegimeVerdict>,
    pub last_kill: Option<KillSwitchReason>,
    pub current_apr: f64,
    pub optimal_apr: f64,
}

impl PairRuntime {
    fn new() -> Self {
        Self {
            candles: Vec::new(),
            candle_cursor: 0,
            epoch: 0,
            suppress_until_epoch: 0,
            params: RangeParams::default(),
            warm_start: None,
            kill_state: KillSwitchState::new(),
            last_forces: None,
            last_decision: None,
            last_regime: None,
            last_kill: None,
            current_apr: 0.0,
            optimal_apr: 0.0,
        }
    }
}

/// Publishable slice of the runtime, shared with the worker's heartbeat.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSnapshot {
    pub epoch: u64,
    pub current_apr: f64,
    pub optimal_apr: f64,
    pub last_decision: Option<String>,
    pub last_decision_ts: i64,
}

pub type SharedSnapshot = Arc<RwLock<RuntimeSnapshot>>;

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Drives one pair. Owns the runtime; everything shared lives in the store.
pub struct Scheduler {
    pair: PairConfig,
    force_params: ForceParams,
    store: Store,
    sink: EventSink,
    market: Arc<dyn MarketFeed>,
    snapshots: Arc<dyn SnapshotFeed>,
    /// Present when the deployment can read gas and execute.
    gateway: Option<Arc<dyn VenueGateway>>,
    /// Present iff a signing key is configured.
    executor: Option<Executor>,
    runtime: PairRuntime,
    shared: SharedSnapshot,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: PairConfig,
        store: Store,
        sink: EventSink,
        market: Arc<dyn MarketFeed>,
        snapshots: Arc<dyn SnapshotFeed>,
        gateway: Option<Arc<dyn VenueGateway>>,
        executor: Option<Executor>,
        shared: SharedSnapshot,
    ) -> Self {
        let force_params = pair.effective_force_params();
        Self {
            pair,
            force_params,
            store,
            sink,
            market,
            snapshots,
            gateway,
            executor,
            runtime: PairRuntime::new(),
            shared,
        }
    }

    /// Restore persisted runtime state (epoch, suppression, warm start,
    /// candle cursor) so a restarted worker resumes where it left off.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let rt = &mut self.runtime;

        if let Some(raw) = self.store.get(&keys::pair_epoch(&self.pair.id)).await? {
            rt.epoch = raw.parse().unwrap_or(0);
        }
        if let Some(raw) = self
            .store
            .get(&keys::pair_regime_suppress(&self.pair.id))
            .await?
        {
            rt.suppress_until_epoch = raw.parse().unwrap_or(0);
        }
        if let Some(raw) = self
            .store
            .get(&keys::pair_candle_cursor(&self.pair.id))
            .await?
        {
            rt.candle_cursor = raw.parse().unwrap_or(0);
        }
        if rt.candle_cursor == 0 {
            rt.candle_cursor = now_ms() - HISTORY_MS;
        }
        if let Some(ws) = get_json::<WarmStart>(
            self.store.as_ref(),
            &keys::pair_optimizer(&self.pair.id),
        )
        .await?
        {
            rt.warm_start = Some(ws.vec);
        }

        info!(
            pair = %self.pair.id,
            epoch = rt.epoch,
            cursor = rt.candle_cursor,
            warm_start = rt.warm_start.is_some(),
            "scheduler state restored"
        );
        Ok(())
    }

    /// The loop driver: run a cycle, then arm a single-shot timer for the
    /// next one. Returns when the shutdown signal flips.
    pub async fn run_loop(&mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.pair.interval_sec);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                // Cycle-level failures are logged; the worker lives on.
                error!(pair = %self.pair.id, error = %e, "cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(pair = %self.pair.id, "scheduler loop stopped");
    }

    // =========================================================================
    // One cycle
    // =========================================================================

    #[instrument(skip(self), fields(pair = %self.pair.id, epoch = self.runtime.epoch + 1))]
    pub async fn run_cycle(&mut self) -> Result<()> {
        let now = now_ms();

        // --- 1. FETCH --------------------------------------------------------
        let (candles_res, snapshots_res) = tokio::join!(
            self.market
                .fetch_m1_since(&self.pair.id, self.runtime.candle_cursor),
            self.snapshots.fetch_snapshots(&self.pair.pools),
        );

        match candles_res {
            Ok(fresh) => self.ingest_candles(fresh, now).await,
            // Best-effort: stale candles are better than no cycle.
            Err(e) => warn!(pair = %self.pair.id, error = %e, "candle fetch failed; using buffer"),
        }

        let snapshots = match snapshots_res {
            Ok(s) => s,
            Err(e) => {
                warn!(pair = %self.pair.id, error = %e, "snapshot fetch failed");
                Vec::new()
            }
        };
        for snap in &snapshots {
            self.sink.emit_json(streams::POOL_SNAPSHOTS, snap);
        }

        if snapshots.is_empty() {
            // Nothing to decide against: emit a zeroed HOLD and stop here.
            let hold = Decision {
                kind: ActionKind::Hold,
                ts: now,
                current_apr: 0.0,
                optimal_apr: 0.0,
                improvement: 0.0,
                target_allocations: Vec::new(),
                range_shifts: None,
            };
            self.finish_cycle(hold, None, now).await;
            return Ok(());
        }

        // --- 2. COMPUTE ------------------------------------------------------
        self.runtime.epoch += 1;
        let epoch = self.runtime.epoch;
        self.store
            .set(&keys::pair_epoch(&self.pair.id), &epoch.to_string(), None, false)
            .await
            .ok();

        let positions = load_positions(self.store.as_ref(), &self.pair.id)
            .await
            .unwrap_or_default();
        let book_value: f64 = positions.iter().map(|p| p.entry_value_usd).sum();
        let capital = if book_value > 0.0 {
            book_value
        } else {
            DEFAULT_CAPITAL_USD
        };

        let verdict = detect(&self.runtime.candles, self.pair.stable_pair);
        if verdict.suppress_epochs > 0 {
            self.runtime.suppress_until_epoch = epoch + verdict.suppress_epochs;
            self.store
                .set(
                    &keys::pair_regime_suppress(&self.pair.id),
                    &self.runtime.suppress_until_epoch.to_string(),
                    None,
                    false,
                )
                .await
                .ok();
        }

        if epoch > self.runtime.suppress_until_epoch
            && self.runtime.candles.len() >= MIN_CANDLES_FOR_OPTIMIZER
        {
            self.optimize(&snapshots, capital, now).await;
        } else if epoch <= self.runtime.suppress_until_epoch {
            debug!(
                pair = %self.pair.id,
                until = self.runtime.suppress_until_epoch,
                "optimizer suppressed this epoch"
            );
        }

        // Regime widening applies to whatever parameters are in force.
        if verdict.widen_factor != 1.0 {
            self.runtime.params = self.runtime.params.widened(verdict.widen_factor);
        }
        self.runtime.last_regime = Some(verdict);

        let forces = if self.runtime.candles.len() >= MIN_CANDLES_FOR_FORCES {
            composite(&self.runtime.candles, &self.force_params)
        } else {
            Forces::neutral()
        };
        self.runtime.last_forces = Some(forces);

        let analyses: Vec<PoolAnalysis> = snapshots
            .iter()
            .map(|s| self.analyze_pool(s, &forces, now))
            .collect();
        let allocation = water_fill(&analyses, self.pair.max_positions, capital);

        // --- 3. DECIDE -------------------------------------------------------
        let price = self
            .runtime
            .candles
            .last()
            .map(|c| c.close)
            .unwrap_or_else(|| snapshots[0].exchange_rate);
        let last_rebalance_ts = positions.iter().map(|p| p.entry_ts).max();

        let gas = match &self.gateway {
            Some(gw) => {
                let chain = &snapshots[0].chain;
                let gas_usd = gw
                    .rebalance_gas_usd(chain)
                    .await
                    .unwrap_or(DEFAULT_GAS_USD);
                Some(GasContext {
                    gas_usd,
                    position_value_usd: capital,
                })
            }
            None => None,
        };

        let thresholds = Thresholds {
            pra: self.pair.thresholds.pra,
            // The optimizer owns the effective RS trigger.
            rs: self.runtime.params.rs_threshold,
        };

        let decision = decide(
            &allocation,
            &positions,
            &forces,
            price,
            &thresholds,
            &self.runtime.params,
            &self.force_params,
            last_rebalance_ts,
            gas,
            now,
        );

        self.runtime.current_apr = decision.current_apr;
        self.runtime.optimal_apr = decision.optimal_apr;
        self.runtime.kill_state.record_yield(decision.current_apr);

        // --- 4. STORE --------------------------------------------------------
        for analysis in &analyses {
            self.sink.emit_json(streams::POOL_ANALYSES, analysis);
        }
        self.sink.emit_json(
            streams::PAIR_ALLOCATIONS,
            &serde_json::json!({
                "ts": now,
                "pair_id": self.pair.id,
                "epoch": epoch,
                "allocations": allocation,
            }),
        );

        // --- 5. EXECUTE + LOG ------------------------------------------------
        let mut report = ExecutionReport::default();
        if decision.kind != ActionKind::Hold {
            if let Some(executor) = &self.executor {
                match executor
                    .execute(
                        &decision,
                        Some(&forces),
                        price,
                        &self.runtime.params,
                        &self.force_params,
                    )
                    .await
                {
                    Ok(r) => report = r,
                    Err(e) => error!(pair = %self.pair.id, error = %e, "execution failed"),
                }
                self.runtime.kill_state.record_gas(now, report.gas_usd);
                for _ in 0..report.range_shifts {
                    self.runtime.kill_state.record_range_shift(now);
                }
            } else {
                info!(
                    pair = %self.pair.id,
                    kind = %decision.kind,
                    "no signer configured; decision not executed"
                );
            }
        }

        self.finish_cycle(decision, Some(price), now).await;
        Ok(())
    }

    // =========================================================================
    // Phase helpers
    // =========================================================================

    /// Append fresh bars, advance the cursor, trim the 30-day window.
    async fn ingest_candles(&mut self, fresh: Vec<Candle>, now: i64) {
        if fresh.is_empty() {
            return;
        }
        for c in &fresh {
            self.sink.emit_json(streams::CANDLES, c);
        }
        if let Some(last) = fresh.last() {
            self.runtime.candle_cursor = last.ts;
        }
        self.runtime.candles.extend(fresh);
        let cutoff = now - HISTORY_MS;
        self.runtime.candles.retain(|c| c.ts >= cutoff);
        self.store
            .set(
                &keys::pair_candle_cursor(&self.pair.id),
                &self.runtime.candle_cursor.to_string(),
                None,
                false,
            )
            .await
            .ok();
    }

    /// Run the optimizer and pass its output through the kill-switches.
    async fn optimize(&mut self, snapshots: &[PoolSnapshot], capital: f64, now: i64) {
        let m15 = aggregate(&self.runtime.candles, M15_MS);
        let pool_fee = snapshots
            .iter()
            .map(|s| s.fee_frac)
            .fold(f64::INFINITY, f64::min);
        let base_apr = self.runtime.optimal_apr.max(0.05);
        let gas_usd = match &self.gateway {
            Some(gw) => gw
                .rebalance_gas_usd(&snapshots[0].chain)
                .await
                .unwrap_or(DEFAULT_GAS_USD),
            None => DEFAULT_GAS_USD,
        };

        let inputs = FitnessInputs {
            candles_m15: &m15,
            pool_fee: if pool_fee.is_finite() { pool_fee } else { 0.003 },
            base_apr,
            gas_per_rebalance_usd: gas_usd,
            position_value_usd: capital,
        };

        let outcome = tune(self.runtime.warm_start, &inputs);

        let (params, kill) = match self
            .runtime
            .kill_state
            .check(&outcome.params, capital, now)
        {
            Some(reason) => {
                warn!(pair = %self.pair.id, reason = %reason, "kill-switch reverted optimizer output");
                (RangeParams::default(), Some(reason))
            }
            None => (outcome.params, None),
        };
        self.runtime.params = params;
        self.runtime.last_kill = kill;

        // Persist the warm start for the restart path.
        let warm = WarmStart {
            vec: params.to_vec(),
            fitness: outcome.fitness,
        };
        self.runtime.warm_start = Some(warm.vec);
        if let Err(e) = set_json(
            self.store.as_ref(),
            &keys::pair_optimizer(&self.pair.id),
            &warm,
            None,
        )
        .await
        {
            warn!(pair = %self.pair.id, error = %e, "failed to persist warm start");
        }

        self.sink.emit_json(
            streams::OPTIMIZER_STATE,
            &serde_json::json!({
                "ts": now,
                "pair_id": self.pair.id,
                "vec": warm.vec,
                "fitness": warm.fitness,
                "evaluations": outcome.evaluations,
                "used_fallback": outcome.used_fallback,
                "kill_switch": kill.map(|k| k.to_string()),
            }),
        );
    }

    /// Join one snapshot with the pair's forces into a pool analysis.
    ///
    /// The pool's depth is assumed spread over a unit relative width, so a
    /// candidate interval of relative breadth `b` competes with `tvl * b` of
    /// resident liquidity; expected in-range time scales with confidence.
    fn analyze_pool(&self, snap: &PoolSnapshot, forces: &Forces, now: i64) -> PoolAnalysis {
        let price = snap.exchange_rate;
        let interval = compute_range(price, forces, &self.runtime.params, &self.force_params);

        let utilization = (interval.confidence / 100.0).clamp(0.0, 1.0);
        let interval_volume = snap.volume_24h * utilization;
        let fees_generated = interval_volume * snap.fee_frac;

        let breadth_frac = if price > 0.0 {
            (interval.breadth / price).max(1e-6)
        } else {
            1.0
        };
        let competing_tvl = snap.tvl * (breadth_frac / DEPTH_REFERENCE_WIDTH).min(1.0);
        let apr = if competing_tvl > 0.0 {
            fees_generated * 365.0 / competing_tvl
        } else {
            0.0
        };

        PoolAnalysis {
            pool_id: snap.pool_id.clone(),
            chain: snap.chain.clone(),
            dex: snap.dex,
            ts: now,
            tvl: snap.tvl,
            fee_frac: snap.fee_frac,
            interval_volume,
            fees_generated,
            utilization,
            apr,
            interval,
        }
    }

    /// Record the decision, publish the epoch snapshot, refresh the shared
    /// projection.
    async fn finish_cycle(&mut self, decision: Decision, price: Option<f64>, now: i64) {
        self.sink.emit_json(
            streams::EPOCH_SNAPSHOTS,
            &serde_json::json!({
                "ts": now,
                "pair_id": self.pair.id,
                "epoch": self.runtime.epoch,
                "price": price,
                "decision": decision.kind,
                "current_apr": decision.current_apr,
                "optimal_apr": decision.optimal_apr,
                "improvement": decision.improvement,
                "params": self.runtime.params,
                "regime": self.runtime.last_regime,
                "kill_switch": self.runtime.last_kill.map(|k| k.to_string()),
            }),
        );

        {
            let mut shared = self.shared.write();
            shared.epoch = self.runtime.epoch;
            shared.current_apr = decision.current_apr;
            shared.optimal_apr = decision.optimal_apr;
            shared.last_decision = Some(decision.kind.to_string());
            shared.last_decision_ts = now;
        }

        info!(
            pair = %self.pair.id,
            epoch = self.runtime.epoch,
            kind = %decision.kind,
            current_apr = format!("{:.4}", decision.current_apr),
            optimal_apr = format!("{:.4}", decision.optimal_apr),
            "cycle complete"
        );
        self.runtime.last_decision = Some(decision);
    }

    #[cfg(test)]
    pub fn runtime(&self) -> &PairRuntime {
        &self.runtime
    }

    #[cfg(test)]
    pub fn runtime_mut(&mut self) -> &mut PairRuntime {
        &mut self.runtime
    }
}

/// Scenario check: a collapsed optimizer output must be replaced by the
/// defaults with the pathological-range reason.
#[cfg(test)]
pub fn resolve_with_kill_switch(
    tuned: RangeParams,
    kill_state: &mut KillSwitchState,
    capital: f64,
    now: i64,
) -> (RangeParams, Option<KillSwitchReason>) {
    match kill_state.check(&tuned, capital, now) {
        Some(reason) => (RangeParams::default(), Some(reason)),
        None => (tuned, None),
    }
}
