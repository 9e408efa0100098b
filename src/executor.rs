// =============================================================================
// Executor — realizing PRA and RS decisions on chain
// =============================================================================
//
// PRA (full reallocation), aborting on the first burn failure:
//   1. burn every open position (burns retried, mints never)
//   2. bridge token0 between chains until per-chain value matches the
//      target weights within 1%
//   3. swap on each funded chain until the token ratio is within 5%
//   4. derive the target range from forces (1% width fallback)
//   5. snapshot per-chain balances once, then mint each allocation sized
//      balance * fraction at an integer 1e9 scale
//
// RS (re-range in place): burn every matched position first — skipping
// individual failures — and only then snapshot and mint proportionally from
// the survivors. Interleaving burn/mint would deplete the balances the
// proportional sizing snapshot depends on.
//
// Every transaction, confirmed or reverted, is emitted onto the tx_log
// stream.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ForceParams;
use crate::coordination::{keys, Store};
use crate::decision::{ActionKind, Decision, RangeShift};
use crate::events::{streams, EventSink};
use crate::forces::Forces;
use crate::range::{compute_range, interval_to_ticks, PriceInterval, RangeParams};
use crate::types::{now_ms, AllocationEntry, Position};
use crate::venues::{ChainBalances, MintRequest, TxOutcome, VenueGateway};

/// Burn attempts before a position is declared stuck.
const BURN_ATTEMPTS: u32 = 3;
/// Fixed pause between burn attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
/// Per-chain weight mismatch tolerated without bridging.
const BRIDGE_TOLERANCE: f64 = 0.01;
/// Token ratio imbalance tolerated without swapping, as a fraction of the
/// chain's total value.
const RATIO_TOLERANCE: f64 = 0.05;
/// Upper bound on ratio-rebalancing swap rounds per chain.
const MAX_SWAP_ROUNDS: usize = 8;
/// Upper bound on bridge legs per reallocation.
const MAX_BRIDGE_LEGS: usize = 8;
/// How long a bridge leg may take to arrive.
const BRIDGE_ARRIVAL_TIMEOUT: Duration = Duration::from_secs(600);
/// Poll cadence while waiting for bridged funds.
const BRIDGE_POLL: Duration = Duration::from_secs(10);
/// Integer scale used for balance * fraction sizing.
const SIZE_SCALE: u128 = 1_000_000_000;
/// Fallback range half-width when no forces are available.
const FALLBACK_WIDTH_FRAC: f64 = 0.01;
const FALLBACK_CONFIDENCE: f64 = 50.0;

// ---------------------------------------------------------------------------
// Transaction events
// ---------------------------------------------------------------------------

/// Kind of on-chain operation, for the tx_log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Burn,
    Mint,
    Swap,
    Bridge,
}

#[derive(Debug, Clone, Serialize)]
struct TxEvent<'a> {
    ts: i64,
    pair_id: &'a str,
    decision: ActionKind,
    op: OpKind,
    pool_id: &'a str,
    chain: &'a str,
    tx_hash: &'a str,
    status: crate::venues::TxStatus,
    gas_used: String,
    gas_price: String,
    gas_usd: f64,
    token0_delta: &'a str,
    token1_delta: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actual_fraction: Option<f64>,
}

/// What the executor did this cycle, fed back into the kill-switch windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionReport {
    pub gas_usd: f64,
    pub range_shifts: usize,
    pub positions_opened: usize,
    pub positions_burned: usize,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Realizes non-HOLD decisions against the venue gateway, keeping the
/// store's position hash in sync with what actually happened on chain.
pub struct Executor {
    pair_id: String,
    gateway: Arc<dyn VenueGateway>,
    store: Store,
    sink: EventSink,
}

impl Executor {
    pub fn new(
        pair_id: impl Into<String>,
        gateway: Arc<dyn VenueGateway>,
        store: Store,
        sink: EventSink,
    ) -> Self {
        Self {
            pair_id: pair_id.into(),
            gateway,
            store,
            sink,
        }
    }

    /// Dispatch one decision. HOLD is a no-op.
    pub async fn execute(
        &self,
        decision: &Decision,
        forces: Option<&Forces>,
        price: f64,
        range_params: &RangeParams,
        force_params: &ForceParams,
    ) -> Result<ExecutionReport> {
        match decision.kind {
            ActionKind::Hold => Ok(ExecutionReport::default()),
            ActionKind::Pra => {
                self.execute_pra(decision, forces, price, range_params, force_params)
                    .await
            }
            ActionKind::Rs => self.execute_rs(decision, price).await,
        }
    }

    // =========================================================================
    // PRA
    // =========================================================================

    async fn execute_pra(
        &self,
        decision: &Decision,
        forces: Option<&Forces>,
        price: f64,
        range_params: &RangeParams,
        force_params: &ForceParams,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        let targets = &decision.target_allocations;

        // --- 1. Burn everything; a stuck burn aborts the whole action -------
        let positions = self.load_positions().await?;
        for pos in &positions {
            match self.burn_with_retry(pos, ActionKind::Pra, &mut report).await {
                Ok(()) => {
                    self.remove_position(pos).await;
                    report.positions_burned += 1;
                }
                Err(e) => {
                    error!(
                        pair = %self.pair_id,
                        position = %pos.id,
                        error = %e,
                        "burn failed; aborting reallocation"
                    );
                    bail!("PRA aborted: burn of {} failed: {e}", pos.id);
                }
            }
        }

        // --- 2. Bridge until per-chain value matches the target weights -----
        // Chains that only held burned positions are sources with weight 0.
        let source_chains: Vec<String> = positions.iter().map(|p| p.chain.clone()).collect();
        self.bridge_to_targets(targets, &source_chains, price, ActionKind::Pra, &mut report)
            .await
            .context("bridging failed")?;

        // --- 3. Even out token ratios on every funded chain -----------------
        for chain in target_chains(targets) {
            self.rebalance_ratio(&chain, price, ActionKind::Pra, &mut report)
                .await;
        }

        // --- 4. Target range -------------------------------------------------
        let range = match forces {
            Some(f) => compute_range(price, f, range_params, force_params),
            None => PriceInterval::symmetric(price, FALLBACK_WIDTH_FRAC, FALLBACK_CONFIDENCE),
        };

        // --- 5 & 6. Snapshot once, then mint every allocation ---------------
        let snapshot = self.snapshot_balances(&target_chains(targets)).await;
        for alloc in targets {
            let Some(balances) = snapshot.get(&alloc.chain) else {
                warn!(
                    pair = %self.pair_id,
                    chain = %alloc.chain,
                    "no balance snapshot for allocation chain; skipping"
                );
                continue;
            };
            if let Err(e) = self
                .mint_allocation(alloc, balances, &range, price, ActionKind::Pra, &mut report)
                .await
            {
                // Per-allocation mint failures are logged and skipped.
                error!(
                    pair = %self.pair_id,
                    pool = %alloc.pool_id,
                    error = %e,
                    "mint failed; continuing with next allocation"
                );
            }
        }

        info!(
            pair = %self.pair_id,
            burned = report.positions_burned,
            opened = report.positions_opened,
            gas_usd = report.gas_usd,
            "reallocation complete"
        );
        Ok(report)
    }

    // =========================================================================
    // RS
    // =========================================================================

    async fn execute_rs(&self, decision: &Decision, price: f64) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        let shifts = decision.range_shifts.as_deref().unwrap_or_default();
        if shifts.is_empty() {
            return Ok(report);
        }

        let positions = self.load_positions().await?;

        // --- Burn phase: all burns complete before any mint ------------------
        let mut burned: Vec<(Position, &RangeShift)> = Vec::new();
        for shift in shifts {
            let Some(pos) = positions.iter().find(|p| p.id == shift.position_id) else {
                warn!(
                    pair = %self.pair_id,
                    position = %shift.position_id,
                    "range shift references an unknown position; skipping"
                );
                continue;
            };
            match self.burn_with_retry(pos, ActionKind::Rs, &mut report).await {
                Ok(()) => {
                    self.remove_position(pos).await;
                    report.positions_burned += 1;
                    burned.push((pos.clone(), shift));
                }
                Err(e) => {
                    warn!(
                        pair = %self.pair_id,
                        position = %pos.id,
                        error = %e,
                        "burn failed; position keeps its old range"
                    );
                }
            }
        }

        if burned.is_empty() {
            return Ok(report);
        }

        // --- Proportional re-mint from the survivors -------------------------
        let total_value: f64 = burned.iter().map(|(p, _)| p.entry_value_usd).sum();
        let chains: Vec<String> = {
            let mut v: Vec<String> = burned.iter().map(|(p, _)| p.chain.clone()).collect();
            v.sort();
            v.dedup();
            v
        };
        let snapshot = self.snapshot_balances(&chains).await;

        for (pos, shift) in &burned {
            let fraction = if total_value > 0.0 {
                pos.entry_value_usd / total_value
            } else {
                1.0 / burned.len() as f64
            };
            let Some(balances) = snapshot.get(&pos.chain) else {
                warn!(
                    pair = %self.pair_id,
                    chain = %pos.chain,
                    "no balance snapshot for shift chain; skipping re-mint"
                );
                continue;
            };
            let alloc = AllocationEntry {
                pool_id: pos.pool_id.clone(),
                chain: pos.chain.clone(),
                dex: pos.dex,
                fraction,
                expected_apr: pos.entry_apr,
            };
            match self
                .mint_allocation(&alloc, balances, &shift.new, price, ActionKind::Rs, &mut report)
                .await
            {
                Ok(()) => report.range_shifts += 1,
                Err(e) => {
                    error!(
                        pair = %self.pair_id,
                        pool = %pos.pool_id,
                        error = %e,
                        "re-mint failed after burn"
                    );
                }
            }
        }

        info!(
            pair = %self.pair_id,
            shifts = report.range_shifts,
            gas_usd = report.gas_usd,
            "range shifts complete"
        );
        Ok(report)
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Burn one position, retrying transient failures with a fixed back-off.
    async fn burn_with_retry(
        &self,
        pos: &Position,
        decision: ActionKind,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=BURN_ATTEMPTS {
            match self.gateway.burn(pos).await {
                Ok(tx) => {
                    self.emit_tx(decision, OpKind::Burn, &pos.pool_id, &pos.chain, &tx, None, None);
                    report.gas_usd += tx.gas_usd;
                    if tx.status.is_confirmed() {
                        return Ok(());
                    }
                    last_err = Some(anyhow::anyhow!("burn tx {} not confirmed", tx.tx_hash));
                }
                Err(e) => last_err = Some(e),
            }
            if attempt < BURN_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("burn failed")))
    }

    /// Move token0 between chains until every chain's share of total value is
    /// within tolerance of its target weight.
    async fn bridge_to_targets(
        &self,
        targets: &[AllocationEntry],
        source_chains: &[String],
        price: f64,
        decision: ActionKind,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        // Target weight per chain = sum of its allocations' fractions.
        let mut weights: HashMap<String, f64> = HashMap::new();
        for t in targets {
            *weights.entry(t.chain.clone()).or_default() += t.fraction;
        }

        let chains: Vec<String> = {
            let mut all: Vec<String> = weights.keys().cloned().collect();
            all.extend(source_chains.iter().cloned());
            all.sort();
            all.dedup();
            all
        };

        for _ in 0..MAX_BRIDGE_LEGS {
            let mut values: HashMap<String, f64> = HashMap::new();
            let mut balances: HashMap<String, ChainBalances> = HashMap::new();
            for chain in &chains {
                let b = self
                    .gateway
                    .balances(chain)
                    .await
                    .with_context(|| format!("reading balances on {chain}"))?;
                values.insert(chain.clone(), chain_value_token0(&b, price));
                balances.insert(chain.clone(), b);
            }
            let total: f64 = values.values().sum();
            if total <= 0.0 {
                return Ok(());
            }

            // Largest surplus and largest deficit.
            let mut source: Option<(String, f64)> = None;
            let mut dest: Option<(String, f64)> = None;
            for chain in &chains {
                let frac = values[chain] / total;
                let target = weights.get(chain).copied().unwrap_or(0.0);
                let gap = frac - target;
                if gap > BRIDGE_TOLERANCE && source.as_ref().map_or(true, |(_, g)| gap > *g) {
                    source = Some((chain.clone(), gap));
                }
                if -gap > BRIDGE_TOLERANCE && dest.as_ref().map_or(true, |(_, g)| -gap > *g) {
                    dest = Some((chain.clone(), -gap));
                }
            }

            let (Some((src, surplus)), Some((dst, deficit))) = (source, dest) else {
                return Ok(()); // Everything within tolerance.
            };

            let move_value = surplus.min(deficit) * total;
            let available = balances[&src].token0;
            let amount = (move_value.min(available as f64)).max(0.0) as u128;
            if amount == 0 {
                return Ok(());
            }

            let pre_transfer = balances[&dst].token0;
            let tx = self
                .gateway
                .bridge(&src, &dst, amount)
                .await
                .with_context(|| format!("bridge {src} -> {dst}"))?;
            self.emit_tx(decision, OpKind::Bridge, "", &src, &tx, None, None);
            report.gas_usd += tx.gas_usd;

            self.await_bridge_arrival(&dst, pre_transfer).await?;
        }

        warn!(pair = %self.pair_id, "bridge leg budget exhausted before convergence");
        Ok(())
    }

    /// Poll the destination until its token0 balance rises past the
    /// pre-transfer reading.
    async fn await_bridge_arrival(&self, chain: &str, pre_transfer: u128) -> Result<()> {
        let deadline = tokio::time::Instant::now() + BRIDGE_ARRIVAL_TIMEOUT;
        loop {
            let b = self.gateway.balances(chain).await?;
            if b.token0 > pre_transfer {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("bridged funds did not arrive on {chain} within the timeout");
            }
            tokio::time::sleep(BRIDGE_POLL).await;
        }
    }

    /// Swap the overweight token for the underweight one until the chain's
    /// token values are within tolerance of each other.
    async fn rebalance_ratio(
        &self,
        chain: &str,
        price: f64,
        decision: ActionKind,
        report: &mut ExecutionReport,
    ) {
        for _ in 0..MAX_SWAP_ROUNDS {
            let balances = match self.gateway.balances(chain).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(chain, error = %e, "balance read failed during ratio rebalance");
                    return;
                }
            };

            let v0 = balances.token0 as f64;
            let v1 = balances.token1 as f64 / price.max(f64::MIN_POSITIVE);
            let total = v0 + v1;
            if total <= 0.0 || (v0 - v1).abs() <= RATIO_TOLERANCE * total {
                return;
            }

            // Swap half the excess toward balance.
            let sell_base = v0 > v1;
            let excess_value = (v0 - v1).abs() / 2.0;
            let amount = if sell_base {
                excess_value as u128
            } else {
                (excess_value * price) as u128
            };
            if amount == 0 {
                return;
            }

            match self.gateway.swap(chain, sell_base, amount).await {
                Ok(tx) => {
                    self.emit_tx(decision, OpKind::Swap, "", chain, &tx, None, None);
                    report.gas_usd += tx.gas_usd;
                    if !tx.status.is_confirmed() {
                        warn!(chain, tx = %tx.tx_hash, "ratio swap not confirmed; stopping");
                        return;
                    }
                }
                Err(e) => {
                    warn!(chain, error = %e, "ratio swap failed; stopping");
                    return;
                }
            }
        }
    }

    /// Read every chain's balances once; this snapshot sizes all mints.
    async fn snapshot_balances(&self, chains: &[String]) -> HashMap<String, ChainBalances> {
        let mut out = HashMap::new();
        for chain in chains {
            match self.gateway.balances(chain).await {
                Ok(b) => {
                    out.insert(chain.clone(), b);
                }
                Err(e) => {
                    warn!(chain = %chain, error = %e, "balance snapshot failed for chain");
                }
            }
        }
        out
    }

    /// Mint one allocation from the chain's snapshot, sized at the integer
    /// 1e9 scale, and persist the resulting position.
    async fn mint_allocation(
        &self,
        alloc: &AllocationEntry,
        balances: &ChainBalances,
        range: &PriceInterval,
        price: f64,
        decision: ActionKind,
        report: &mut ExecutionReport,
    ) -> Result<()> {
        let amount0 = mul_fraction(balances.token0, alloc.fraction);
        let amount1 = mul_fraction(balances.token1, alloc.fraction);
        if amount0 == 0 && amount1 == 0 {
            bail!("allocation sized to zero on {}", alloc.chain);
        }

        let spacing = self
            .gateway
            .tick_spacing(&alloc.chain, &alloc.pool_id)
            .await
            .unwrap_or(1);
        let (lower, upper) = interval_to_ticks(range, spacing);

        let request = MintRequest {
            chain: alloc.chain.clone(),
            pool_id: alloc.pool_id.clone(),
            dex: alloc.dex,
            lower_bound: lower,
            upper_bound: upper,
            amount0,
            amount1,
            entry_apr: alloc.expected_apr,
            entry_value_usd: chain_value_token0(balances, price) * alloc.fraction,
            entry_price: price,
        };

        let outcome = self.gateway.mint(&request).await?;
        self.emit_tx(
            decision,
            OpKind::Mint,
            &alloc.pool_id,
            &alloc.chain,
            &outcome.tx,
            Some(alloc.fraction),
            Some(alloc.fraction),
        );
        report.gas_usd += outcome.tx.gas_usd;

        if !outcome.tx.status.is_confirmed() {
            bail!("mint tx {} not confirmed", outcome.tx.tx_hash);
        }

        self.save_position(&outcome.position).await;
        report.positions_opened += 1;
        Ok(())
    }

    // =========================================================================
    // Position hash & events
    // =========================================================================

    async fn load_positions(&self) -> Result<Vec<Position>> {
        load_positions(self.store.as_ref(), &self.pair_id).await
    }

    async fn save_position(&self, pos: &Position) {
        let key = keys::pair_positions(&self.pair_id);
        match serde_json::to_string(pos) {
            Ok(raw) => {
                if let Err(e) = self.store.hset(&key, &pos.id, &raw).await {
                    error!(pair = %self.pair_id, position = %pos.id, error = %e, "failed to persist position");
                }
            }
            Err(e) => error!(position = %pos.id, error = %e, "failed to encode position"),
        }
        self.sink.emit_json(
            streams::POSITIONS,
            &serde_json::json!({ "ts": now_ms(), "action": "opened", "position": pos }),
        );
    }

    async fn remove_position(&self, pos: &Position) {
        let key = keys::pair_positions(&self.pair_id);
        if let Err(e) = self.store.hdel(&key, &pos.id).await {
            error!(pair = %self.pair_id, position = %pos.id, error = %e, "failed to delete position");
        }
        self.sink.emit_json(
            streams::POSITIONS,
            &serde_json::json!({ "ts": now_ms(), "action": "burned", "position": pos }),
        );
    }

    fn emit_tx(
        &self,
        decision: ActionKind,
        op: OpKind,
        pool_id: &str,
        chain: &str,
        tx: &TxOutcome,
        target_fraction: Option<f64>,
        actual_fraction: Option<f64>,
    ) {
        self.sink.emit_json(
            streams::TX_LOG,
            &TxEvent {
                ts: now_ms(),
                pair_id: &self.pair_id,
                decision,
                op,
                pool_id,
                chain,
                tx_hash: &tx.tx_hash,
                status: tx.status,
                gas_used: tx.gas_used.to_string(),
                gas_price: tx.gas_price.to_string(),
                gas_usd: tx.gas_usd,
                token0_delta: &tx.token0_delta,
                token1_delta: &tx.token1_delta,
                target_fraction,
                actual_fraction,
            },
        );
    }
}

/// Read and decode the pair's position hash; malformed records are skipped
/// with a warning.
pub async fn load_positions(
    store: &dyn crate::coordination::CoordinationStore,
    pair_id: &str,
) -> Result<Vec<Position>> {
    let key = keys::pair_positions(pair_id);
    let entries = store.hgetall(&key).await.context("reading position hash")?;
    let mut positions = Vec::with_capacity(entries.len());
    for (field, raw) in entries {
        match serde_json::from_str::<Position>(&raw) {
            Ok(p) => positions.push(p),
            Err(e) => warn!(
                pair = %pair_id,
                field = %field,
                error = %e,
                "malformed position record skipped"
            ),
        }
    }
    Ok(positions)
}

/// Chain value expressed in token0 units (token1 converted at the pair
/// price).
fn chain_value_token0(balances: &ChainBalances, price: f64) -> f64 {
    balances.token0 as f64 + balances.token1 as f64 / price.max(f64::MIN_POSITIVE)
}

/// `amount * fraction` at an integer 1e9 scale, overflow-safe for balances
/// up to u128::MAX / 1e9 per limb.
fn mul_fraction(amount: u128, fraction: f64) -> u128 {
    let scale = (fraction.clamp(0.0, 1.0) * SIZE_SCALE as f64).round() as u128;
    (amount / SIZE_SCALE) * scale + (amount % SIZE_SCALE) * scale / SIZE_SCALE
}

fn target_chains(targets: &[AllocationEntry]) -> Vec<String> {
    let mut chains: Vec<String> = targets.iter().map(|t| t.chain.clone()).collect();
    chains.sort();
    chains.dedup();
    chains
}
