//! Shared types and run-wide control state for the tpx3 pipeline crates.

pub mod context;
pub mod timing;

pub use context::RunContext;
pub use timing::{Timer, now_ns};

/// Period number. Periods are the intervals between consecutive TDC pulses,
/// numbered by the period predictor.
pub type Period = i64;

/// Sentinel for "no period". Used as the free marker in the aggregator's
/// slot pool and never produced by the predictor.
pub const PERIOD_NONE: Period = i64::MIN;
