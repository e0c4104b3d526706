//! `tpx3-buffers`: IO buffering between the raw-stream reader and the
//! per-chip analyser threads.
//!
//! # Core components
//!
//! - [`SpinLock`]: short-critical-section lock with a spin/yield/sleep
//!   acquisition ladder
//! - [`IoBuffer`]: cacheline-aligned, move-only byte buffer carrying its
//!   position within the originating stream chunk
//! - [`BufferPool`]: per-chip free list plus packet-id-ordered map of
//!   filled buffers
//!
//! # Architecture
//!
//! ```text
//! ┌────────┐ acquire_empty / submit_filled ┌────────────┐ take_filled ┌──────────┐
//! │ reader │ ────────────────────────────► │ BufferPool │ ──────────► │ analyser │
//! │ thread │ ◄──────────────────────────── │ (per chip) │ ◄────────── │  thread  │
//! └────────┘          (free list)          └────────────┘   release   └──────────┘
//! ```
//!
//! The filled side is keyed by packet id, so the analyser consumes buffers
//! in original detector order even though the reader multiplexes chips.

mod buffer;
mod pool;
mod spin;

pub use buffer::{BUFFER_ALIGNMENT, IoBuffer};
pub use pool::BufferPool;
pub use spin::{SpinGuard, SpinLock};
