// =============================================================================
// Numeric Indicators Module
// =============================================================================
//
// Pure, side-effect-free primitives behind the signal engine: Parkinson
// range volatility, Wilder RSI, rolling-sum SMA, and fixed-period candle
// aggregation. Deterministic by construction — no clocks, no I/O.

pub mod aggregate;
pub mod parkinson;
pub mod rsi;
pub mod sma;
