//! Timing reconstruction for the Timepix3 stream: TOA-ordered event
//! reordering, TDC interval prediction and event-to-period assignment.

#![forbid(unsafe_code)]

pub mod predictor;
pub mod queues;
pub mod reorder;

pub use predictor::{MIN_TDC_SAMPLES, PeriodPredictor};
pub use queues::{PeriodIndex, PeriodQueueEntry, PeriodQueues};
pub use reorder::{ReorderElement, ReorderQueue};
