//! `tpx3-spectra`: time-resolved energy-point spectra.
//!
//! # Core components
//!
//! - [`SpectraData`]: one flat `troi_n x npoints` histogram with
//!   before/after-ROI counters and the event binning rule
//! - [`Aggregator`]: bounded pool of period slots holding per-thread
//!   partial spectra; analysers fill them lock-free and a fan-in barrier
//!   hands completed periods to the writer thread
//! - [`SpectraWriter`]: destination abstraction with file
//!   (`file:<base>` -> `<base>-<period>.xes`) and network
//!   (`tcp:<host>:<port>`, one JSON object per period) implementations
//!
//! # Data flow
//!
//! ```text
//!  analyser 0 ──┐ with_data / return_data  ┌───────────────┐
//!  analyser 1 ──┼──────────────────────────► slot pool      │ ready == n
//!  analyser N ──┘                          │ (per period)   ├───────────► writer thread
//!                                          └───────────────┘   queue      fold + emit
//! ```

pub mod aggregator;
pub mod data;
pub mod writer;

pub use aggregator::{Aggregator, AggregatorError, SlotCache, WriterHandle};
pub use data::SpectraData;
pub use writer::{SpectraWriter, WriterError, writer_from_uri};
