//! `xestream-engine`: the acquisition pipeline.
//!
//! One reader thread frames the multiplexed raw TCP stream into per-chip
//! buffer pools; one analyser thread per chip decodes words, reconstructs
//! the TDC period structure and commits events into the spectra
//! aggregator. Threading is plain native threads with a readiness barrier
//! at startup and cooperative drain on stop.
//!
//! ```text
//! TCP ──► reader ──► BufferPool[chip] ──► analyser[chip] ──► Aggregator ──► writer
//!                        (tpx3-buffers)     (predictor + period queues)
//! ```

mod analyser;
mod pipeline;
mod reader;
mod stats;

pub use pipeline::{Pipeline, PipelineConfig};
pub use stats::RunStats;
