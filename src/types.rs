// =============================================================================
// Shared types used across the Tidepool liquidity engine
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// A single OHLCV bar with its open timestamp in epoch milliseconds, aligned
/// to the bar period. Base bars are one minute; higher timeframes are derived
/// by aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A bar is usable for range math only when its extremes are positive and
    /// ordered (`low <= open, close <= high`).
    pub fn is_well_formed(&self) -> bool {
        self.low > 0.0
            && self.high >= self.low
            && self.open >= self.low
            && self.open <= self.high
            && self.close >= self.low
            && self.close <= self.high
    }
}

// ---------------------------------------------------------------------------
// Venues
// ---------------------------------------------------------------------------

/// Protocol shape of a venue. The engine only cares whether positions are
/// tick-based or bin-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DexFamily {
    V3,
    V4,
    Algebra,
    /// Liquidity-book AMM addressed by discrete bin ids, not ticks.
    Lb,
}

impl DexFamily {
    /// Bin-based venues do not share the tick price scale and must be
    /// excluded from tick-space divergence comparisons.
    pub fn is_bin_based(self) -> bool {
        matches!(self, Self::Lb)
    }
}

impl std::fmt::Display for DexFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V3 => write!(f, "v3"),
            Self::V4 => write!(f, "v4"),
            Self::Algebra => write!(f, "algebra"),
            Self::Lb => write!(f, "lb"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pool snapshots & analyses
// ---------------------------------------------------------------------------

/// Point-in-time market state of one pool on one chain, as returned by the
/// snapshot feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pool_id: String,
    pub chain: String,
    pub dex: DexFamily,
    pub ts: i64,
    pub volume_24h: f64,
    pub tvl: f64,
    /// Pool fee as a fraction (e.g. 0.003 for a 30 bps pool).
    pub fee_frac: f64,
    pub base_price_usd: f64,
    pub quote_price_usd: f64,
    /// Base/quote exchange rate (pool price).
    pub exchange_rate: f64,
    #[serde(default)]
    pub price_change_h1: f64,
    #[serde(default)]
    pub price_change_h24: f64,
}

/// Per-cycle derivation joining a snapshot with the pair's forces: how much
/// of the 24h volume the candidate interval would capture, the fees that
/// implies, and the resulting annualized APR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAnalysis {
    pub pool_id: String,
    pub chain: String,
    pub dex: DexFamily,
    pub ts: i64,
    pub tvl: f64,
    pub fee_frac: f64,
    pub interval_volume: f64,
    pub fees_generated: f64,
    /// Fraction of pool TVL expected to sit inside the candidate interval.
    pub utilization: f64,
    pub apr: f64,
    pub interval: crate::range::PriceInterval,
}

// ---------------------------------------------------------------------------
// Allocations
// ---------------------------------------------------------------------------

/// One row of a target allocation. The full set sums to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub pool_id: String,
    pub chain: String,
    pub dex: DexFamily,
    /// Fraction of total capital assigned to this pool, in [0, 1].
    pub fraction: f64,
    /// Marginal APR expected after our capital is added to the pool.
    pub expected_apr: f64,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// An open LP position. `lower_bound` / `upper_bound` are protocol-neutral:
/// ticks for V3/V4/Algebra venues, bin ids for LB venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Engine-assigned identifier (UUID v4).
    pub id: String,
    pub pool_id: String,
    pub chain: String,
    pub dex: DexFamily,
    /// Identifier of the position on the venue (NFT id, bin receipt, ...).
    pub venue_position_id: String,
    pub lower_bound: i32,
    pub upper_bound: i32,
    #[serde(with = "u128_string")]
    pub liquidity: u128,
    #[serde(with = "u128_string")]
    pub amount0: u128,
    #[serde(with = "u128_string")]
    pub amount1: u128,
    pub entry_price: f64,
    pub entry_ts: i64,
    pub entry_apr: f64,
    pub entry_value_usd: f64,
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Run status published by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Error,
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Publishable projection of a worker's runtime, written to the coordination
/// store on every heartbeat and read by the supervisor's API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub pair_id: String,
    pub pid: u32,
    pub status: WorkerStatus,
    pub uptime_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub current_apr: f64,
    #[serde(default)]
    pub optimal_apr: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<String>,
    #[serde(default)]
    pub last_decision_ts: i64,
}

// ---------------------------------------------------------------------------
// u128 <-> decimal string serde
// ---------------------------------------------------------------------------

/// Token amounts and liquidity travel as decimal strings so that no JSON
/// consumer silently truncates them to a double.
pub mod u128_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(de)?;
        raw.parse::<u128>()
            .map_err(|e| D::Error::custom(format!("invalid u128 string {raw:?}: {e}")))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_well_formed() {
        let c = Candle {
            ts: 0,
            open: 1.0,
            high: 1.2,
            low: 0.9,
            close: 1.1,
            volume: 10.0,
        };
        assert!(c.is_well_formed());
    }

    #[test]
    fn candle_rejects_non_positive_low() {
        let c = Candle {
            ts: 0,
            open: 1.0,
            high: 1.2,
            low: 0.0,
            close: 1.1,
            volume: 10.0,
        };
        assert!(!c.is_well_formed());
    }

    #[test]
    fn candle_rejects_inverted_extremes() {
        let c = Candle {
            ts: 0,
            open: 1.0,
            high: 0.8,
            low: 0.9,
            close: 1.0,
            volume: 10.0,
        };
        assert!(!c.is_well_formed());
    }

    #[test]
    fn dex_family_bin_classification() {
        assert!(DexFamily::Lb.is_bin_based());
        assert!(!DexFamily::V3.is_bin_based());
        assert!(!DexFamily::V4.is_bin_based());
        assert!(!DexFamily::Algebra.is_bin_based());
    }

    #[test]
    fn position_u128_roundtrip_as_string() {
        let pos = Position {
            id: "p-1".into(),
            pool_id: "0xabc".into(),
            chain: "base".into(),
            dex: DexFamily::V3,
            venue_position_id: "4242".into(),
            lower_bound: -887220,
            upper_bound: 887220,
            liquidity: 340_282_366_920_938_463_463_374_607_431_768_211_455,
            amount0: 1_000_000_000_000_000_000_000,
            amount1: 5_000_000,
            entry_price: 1.0,
            entry_ts: 1_700_000_000_000,
            entry_apr: 0.12,
            entry_value_usd: 10_000.0,
        };
        let json = serde_json::to_string(&pos).unwrap();
        assert!(json.contains("\"340282366920938463463374607431768211455\""));
        assert!(json.contains("\"1000000000000000000000\""));
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.liquidity, pos.liquidity);
        assert_eq!(back.amount0, pos.amount0);
        assert_eq!(back.amount1, pos.amount1);
    }

    #[test]
    fn u128_string_rejects_garbage() {
        let res: Result<Position, _> = serde_json::from_str(
            r#"{"id":"x","pool_id":"p","chain":"c","dex":"v3","venue_position_id":"1",
                "lower_bound":0,"upper_bound":1,"liquidity":"not-a-number",
                "amount0":"0","amount1":"0","entry_price":1.0,"entry_ts":0,
                "entry_apr":0.0,"entry_value_usd":0.0}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn worker_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&WorkerStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(format!("{}", WorkerStatus::Stopped), "stopped");
    }
}
