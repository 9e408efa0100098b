// =============================================================================
// Venue Seams — market data feeds and the on-chain gateway
// =============================================================================
//
// The decision core never talks to an exchange, a REST indexer, or an RPC
// node directly; it goes through these traits. Production implementations
// live behind them (the REST feeds in `venues::http`, chain gateways in the
// deployment binaries); tests substitute deterministic fakes.
// =============================================================================

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PoolRef;
use crate::types::{u128_string, Candle, DexFamily, PoolSnapshot, Position};

/// Default slippage tolerance for swaps, basis points.
pub const DEFAULT_SLIPPAGE_BPS: u32 = 50;
/// Multiplier applied to gas estimates before submission.
pub const GAS_BUFFER: f64 = 1.2;

// ---------------------------------------------------------------------------
// Market data feeds
// ---------------------------------------------------------------------------

/// Source of base (M1) candles for a pair.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Fetch all M1 bars with `ts > since_ms`, oldest first.
    async fn fetch_m1_since(&self, pair_id: &str, since_ms: i64) -> anyhow::Result<Vec<Candle>>;
}

/// Source of per-pool market snapshots.
#[async_trait]
pub trait SnapshotFeed: Send + Sync {
    async fn fetch_snapshots(&self, pools: &[PoolRef]) -> anyhow::Result<Vec<PoolSnapshot>>;
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Terminal status of a submitted transaction. Receipt polling that times
/// out is not retried; it surfaces as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Confirmed,
    Reverted,
    Unknown,
}

impl TxStatus {
    pub fn is_confirmed(self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

/// What came back from one on-chain operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutcome {
    pub tx_hash: String,
    pub status: TxStatus,
    #[serde(with = "u128_string")]
    pub gas_used: u128,
    #[serde(with = "u128_string")]
    pub gas_price: u128,
    /// Gas cost converted to USD by the gateway.
    pub gas_usd: f64,
    /// Token0 delta from our account's perspective (signed, decimal string).
    pub token0_delta: String,
    /// Token1 delta from our account's perspective (signed, decimal string).
    pub token1_delta: String,
}

/// Per-chain token balances of the managed account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBalances {
    #[serde(with = "u128_string")]
    pub token0: u128,
    #[serde(with = "u128_string")]
    pub token1: u128,
}

/// Everything a mint needs.
#[derive(Debug, Clone)]
pub struct MintRequest {
    pub chain: String,
    pub pool_id: String,
    pub dex: DexFamily,
    pub lower_bound: i32,
    pub upper_bound: i32,
    pub amount0: u128,
    pub amount1: u128,
    /// APR estimate and value recorded on the resulting position.
    pub entry_apr: f64,
    pub entry_value_usd: f64,
    pub entry_price: f64,
}

/// A successful mint: the new position plus its transaction.
#[derive(Debug, Clone)]
pub struct MintOutcome {
    pub position: Position,
    pub tx: TxOutcome,
}

/// On-chain execution surface, one implementation per deployment. All calls
/// carry their own timeouts; receipt waits are bounded at two minutes.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    /// Remove a position's liquidity and collect its tokens.
    async fn burn(&self, position: &Position) -> anyhow::Result<TxOutcome>;

    /// Open a fresh position.
    async fn mint(&self, request: &MintRequest) -> anyhow::Result<MintOutcome>;

    /// Swap between the pair's tokens on one chain. `sell_base` sells
    /// token0 for token1.
    async fn swap(&self, chain: &str, sell_base: bool, amount: u128)
        -> anyhow::Result<TxOutcome>;

    /// Initiate a token0 bridge transfer between chains. Arrival is observed
    /// by the caller through `balances`.
    async fn bridge(
        &self,
        from_chain: &str,
        to_chain: &str,
        amount: u128,
    ) -> anyhow::Result<TxOutcome>;

    /// Current token balances on one chain.
    async fn balances(&self, chain: &str) -> anyhow::Result<ChainBalances>;

    /// Tick (or bin) spacing of a pool.
    async fn tick_spacing(&self, chain: &str, pool_id: &str) -> anyhow::Result<i32>;

    /// Estimated all-in gas cost of one rebalance on a chain, USD.
    async fn rebalance_gas_usd(&self, chain: &str) -> anyhow::Result<f64>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&TxStatus::Confirmed).unwrap(),
            "\"confirmed\""
        );
        assert!(TxStatus::Confirmed.is_confirmed());
        assert!(!TxStatus::Unknown.is_confirmed());
    }

    #[test]
    fn chain_balances_serialize_as_strings() {
        let b = ChainBalances {
            token0: u128::MAX,
            token1: 0,
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains(&format!("\"{}\"", u128::MAX)));
        let back: ChainBalances = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
