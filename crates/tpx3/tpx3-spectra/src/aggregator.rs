//! Period slot pool with a fan-in barrier and writer hand-off.
//!
//! # Design
//!
//! - **Slots**: a fixed pool of period slots. A slot is free while its
//!   `period` field holds [`PERIOD_NONE`]; an analyser claims one for a new
//!   period with a CAS. Every slot carries one [`SpectraData`] per analyser
//!   thread, so event recording never takes a lock.
//! - **Fan-in**: when a chip is done with a period it returns its buffer;
//!   the slot's `ready` counter reaching the thread count enqueues the slot
//!   for the writer exactly once.
//! - **Writer thread**: folds the per-thread buffers into the first one,
//!   emits the merged spectra, zeroes the slot and frees it.
//!
//! Slot claiming scans in fixed order, so two threads racing to create the
//! same period contend on the same free slot and the CAS loser finds the
//! winner's slot on its retry scan.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

use tpx3_core::{PERIOD_NONE, Period, RunContext};
use tpx3_detector::Detector;

use crate::data::SpectraData;
use crate::writer::SpectraWriter;

/// Backoff while every slot is occupied (the writer is overloaded).
const OVERLOAD_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregatorError {
    /// The writer is gone; no further period data can be accepted.
    #[error("spectra writer has stopped")]
    WriterStopped,
}

struct Slot {
    /// Period this slot aggregates, `PERIOD_NONE` while free.
    period: AtomicI64,
    /// Number of threads that returned their buffer for this period.
    ready: AtomicU32,
    /// Set once the slot has been queued for the writer.
    queued: AtomicU32,
    thread_data: Box<[UnsafeCell<SpectraData>]>,
}

// SAFETY: `thread_data[t]` is only written by analyser thread `t` while the
// slot is claimed, and read by the writer thread strictly after the fan-in
// barrier (or after all analysers terminated, for the shutdown drain). The
// Release/Acquire pairs on `ready` and `queued` order those accesses.
unsafe impl Sync for Slot {}

#[derive(Default)]
struct WriterQueue {
    ready: VecDeque<usize>,
    stopped: bool,
}

/// Per-analyser-thread cache of the last `(period, slot)` pair, giving O(1)
/// slot lookup for the common case of many events in the same period.
#[derive(Debug, Clone, Copy)]
pub struct SlotCache {
    period: Period,
    slot: usize,
}

impl SlotCache {
    pub fn new() -> Self {
        Self {
            period: PERIOD_NONE,
            slot: 0,
        }
    }

    #[inline]
    fn invalidate(&mut self) {
        self.period = PERIOD_NONE;
    }
}

impl Default for SlotCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The slot pool. Shared between all analyser threads and the writer.
pub struct Aggregator {
    slots: Box<[Slot]>,
    nthreads: usize,
    queue: Mutex<WriterQueue>,
    action_required: Condvar,
}

impl Aggregator {
    /// Pool of `nslots` slots, each with one spectra buffer per analyser
    /// thread. `nslots` must cover the retained period queues of all chips
    /// plus one in-flight period per chip, or analysers will stall waiting
    /// for the writer.
    pub fn new(det: &Detector, nslots: usize) -> Arc<Self> {
        let nthreads = det.num_chips();
        let slots = (0..nslots)
            .map(|_| Slot {
                period: AtomicI64::new(PERIOD_NONE),
                ready: AtomicU32::new(0),
                queued: AtomicU32::new(0),
                thread_data: (0..nthreads)
                    .map(|_| UnsafeCell::new(SpectraData::new(det)))
                    .collect(),
            })
            .collect();
        Arc::new(Self {
            slots,
            nthreads,
            queue: Mutex::new(WriterQueue::default()),
            action_required: Condvar::new(),
        })
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Run `f` on thread `thread`'s spectra buffer for `period`, claiming a
    /// free slot if the period has none yet.
    pub fn with_data<R>(
        &self,
        thread: usize,
        period: Period,
        cache: &mut SlotCache,
        f: impl FnOnce(&mut SpectraData) -> R,
    ) -> Result<R, AggregatorError> {
        let idx = if cache.period == period {
            cache.slot
        } else {
            let idx = self.slot_for(period)?;
            cache.period = period;
            cache.slot = idx;
            idx
        };
        // SAFETY: this slot is claimed for `period` and cell `thread` is
        // exclusively ours until we return the buffer (see Slot).
        let data = unsafe { &mut *self.slots[idx].thread_data[thread].get() };
        Ok(f(data))
    }

    /// Declare thread `thread` done with `period`. Once all threads have,
    /// the slot moves to the writer queue.
    pub fn return_data(
        &self,
        thread: usize,
        period: Period,
        cache: &mut SlotCache,
    ) -> Result<(), AggregatorError> {
        debug_assert!(thread < self.nthreads);
        cache.invalidate();
        let idx = self.slot_for(period)?;
        let slot = &self.slots[idx];
        if slot.ready.fetch_add(1, Ordering::AcqRel) + 1 == self.nthreads as u32 {
            self.enqueue_once(idx);
        }
        Ok(())
    }

    /// Stop accepting data, push any still-claimed slot to the writer and
    /// let the writer thread drain and exit.
    ///
    /// Call only after the analyser threads have terminated; the shutdown
    /// drain hands slots to the writer without a complete fan-in.
    pub fn finish(&self) {
        for idx in 0..self.slots.len() {
            if self.slots[idx].period.load(Ordering::Acquire) != PERIOD_NONE {
                self.enqueue_once(idx);
            }
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.stopped = true;
        }
        self.action_required.notify_all();
    }

    /// Start the writer thread. Emission failures record the error in `ctx`
    /// and stop the pipeline.
    pub fn spawn_writer(
        self: &Arc<Self>,
        mut writer: Box<dyn SpectraWriter>,
        ctx: Arc<RunContext>,
    ) -> WriterHandle {
        let aggregator = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            debug!(dest = %writer.dest(), "writer thread started");
            let mut written = 0u64;
            loop {
                let idx = {
                    let mut queue = aggregator
                        .queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    loop {
                        if let Some(idx) = queue.ready.pop_front() {
                            break Some(idx);
                        }
                        if queue.stopped {
                            break None;
                        }
                        queue = aggregator
                            .action_required
                            .wait(queue)
                            .unwrap_or_else(|e| e.into_inner());
                    }
                };
                let Some(idx) = idx else { break };

                let slot = &aggregator.slots[idx];
                let period = slot.period.load(Ordering::Acquire);
                debug!(period, "aggregating and writing period data");

                // SAFETY: the slot was handed over through the fan-in
                // barrier or the post-join shutdown drain; no analyser
                // accesses it anymore.
                let merged = unsafe { &mut *slot.thread_data[0].get() };
                for cell in &slot.thread_data[1..] {
                    let donor = unsafe { &mut *cell.get() };
                    merged.merge_from(donor);
                }

                if let Err(err) = writer.write(merged, period) {
                    error!(period, %err, "spectra write failed");
                    ctx.fail(format!("writer: {err}"));
                    let mut queue = aggregator
                        .queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    queue.stopped = true;
                    break;
                }
                written += 1;

                merged.reset();
                slot.ready.store(0, Ordering::Release);
                slot.queued.store(0, Ordering::Release);
                slot.period.store(PERIOD_NONE, Ordering::Release);
            }
            debug!(written, "writer thread stopped");
        });
        WriterHandle { handle }
    }

    fn enqueue_once(&self, idx: usize) {
        if self.slots[idx].queued.swap(1, Ordering::AcqRel) == 0 {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.ready.push_back(idx);
            drop(queue);
            self.action_required.notify_one();
        }
    }

    /// Find the slot holding `period`, or claim a free one for it. Spins
    /// (with a sleep) while the pool is exhausted.
    fn slot_for(&self, period: Period) -> Result<usize, AggregatorError> {
        loop {
            let mut first_free = None;
            for (i, slot) in self.slots.iter().enumerate() {
                let p = slot.period.load(Ordering::Acquire);
                if p == period {
                    return Ok(i);
                }
                if first_free.is_none() && p == PERIOD_NONE {
                    first_free = Some(i);
                }
            }
            match first_free {
                Some(i) => {
                    if self.slots[i]
                        .period
                        .compare_exchange(
                            PERIOD_NONE,
                            period,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Ok(i);
                    }
                    // lost the race; rescan, the winner may hold our period
                }
                None => {
                    if self
                        .queue
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .stopped
                    {
                        return Err(AggregatorError::WriterStopped);
                    }
                    // pool exhausted, the writer is behind
                    std::thread::sleep(OVERLOAD_SLEEP);
                }
            }
        }
    }
}

/// Join handle for the writer thread.
pub struct WriterHandle {
    handle: JoinHandle<()>,
}

impl WriterHandle {
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;
    use tpx3_detector::{DetectorLayout, PixelIndex, PixelMap};

    use crate::writer::WriterError;

    struct CaptureWriter {
        tx: mpsc::Sender<(Period, f64, u64)>,
    }

    impl SpectraWriter for CaptureWriter {
        fn write(&mut self, data: &SpectraData, period: Period) -> Result<(), WriterError> {
            self.tx
                .send((period, data.sum(), data.total))
                .map_err(|_| WriterError::UnknownScheme("capture".into()))
        }

        fn dest(&self) -> String {
            "capture".into()
        }
    }

    fn detector(chips: usize) -> Detector {
        let mut det = Detector::new(DetectorLayout::row(chips));
        det.set_time_roi(0, 1, 100);
        let mut lines = String::new();
        for c in 0..chips {
            lines.push_str(&format!("{c},0,0,1.0\n"));
        }
        det.energy_points = PixelMap::from_text(Cursor::new(lines), chips).unwrap();
        det
    }

    #[test]
    fn slot_is_written_only_after_full_fan_in() {
        let det = detector(3);
        let aggregator = Aggregator::new(&det, 4);
        let ctx = Arc::new(RunContext::new());
        let (tx, rx) = mpsc::channel();
        let writer = aggregator.spawn_writer(Box::new(CaptureWriter { tx }), Arc::clone(&ctx));

        let mut caches = [SlotCache::new(), SlotCache::new(), SlotCache::new()];
        for (thread, cache) in caches.iter_mut().enumerate() {
            aggregator
                .with_data(thread, 7, cache, |data| {
                    data.record(&det, PixelIndex::from_flat(thread as u32, 0), 5, 10);
                })
                .unwrap();
        }

        aggregator.return_data(0, 7, &mut caches[0]).unwrap();
        aggregator.return_data(1, 7, &mut caches[1]).unwrap();
        assert!(
            rx.recv_timeout(Duration::from_millis(50)).is_err(),
            "period emitted before fan-in completed"
        );

        aggregator.return_data(2, 7, &mut caches[2]).unwrap();
        let (period, sum, total) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(period, 7);
        assert_eq!(sum, 3.0);
        assert_eq!(total, 3);

        aggregator.finish();
        writer.join();
        assert_eq!(ctx.last_error(), None);
    }

    #[test]
    fn slots_recycle_after_writing() {
        let det = detector(1);
        let aggregator = Aggregator::new(&det, 2);
        let ctx = Arc::new(RunContext::new());
        let (tx, rx) = mpsc::channel();
        let writer = aggregator.spawn_writer(Box::new(CaptureWriter { tx }), Arc::clone(&ctx));

        let mut cache = SlotCache::new();
        // more periods than slots; recycling must keep up
        for period in 0..16 {
            aggregator
                .with_data(0, period, &mut cache, |data| {
                    data.record(&det, PixelIndex::from_flat(0, 0), 1, 10);
                })
                .unwrap();
            aggregator.return_data(0, period, &mut cache).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..16 {
            let (period, sum, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(sum, 1.0);
            seen.push(period);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());

        aggregator.finish();
        writer.join();
    }

    #[test]
    fn finish_drains_incomplete_periods() {
        let det = detector(2);
        let aggregator = Aggregator::new(&det, 4);
        let ctx = Arc::new(RunContext::new());
        let (tx, rx) = mpsc::channel();
        let writer = aggregator.spawn_writer(Box::new(CaptureWriter { tx }), Arc::clone(&ctx));

        let mut cache = SlotCache::new();
        aggregator
            .with_data(0, 3, &mut cache, |data| {
                data.record(&det, PixelIndex::from_flat(0, 0), 1, 10);
            })
            .unwrap();
        // only one of two chips returns; shutdown must still flush period 3
        aggregator.return_data(0, 3, &mut cache).unwrap();

        aggregator.finish();
        writer.join();
        let (period, sum, _) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(period, 3);
        assert_eq!(sum, 1.0);
    }

    #[test]
    fn empty_period_completes_fan_in() {
        let det = detector(2);
        let aggregator = Aggregator::new(&det, 4);
        let ctx = Arc::new(RunContext::new());
        let (tx, rx) = mpsc::channel();
        let writer = aggregator.spawn_writer(Box::new(CaptureWriter { tx }), Arc::clone(&ctx));

        // neither chip ever recorded an event for period 9
        let mut c0 = SlotCache::new();
        let mut c1 = SlotCache::new();
        aggregator.return_data(0, 9, &mut c0).unwrap();
        aggregator.return_data(1, 9, &mut c1).unwrap();

        let (period, sum, total) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((period, sum, total), (9, 0.0, 0));

        aggregator.finish();
        writer.join();
    }
}
