//! Per-chip pool connecting the reader to one analyser.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::buffer::IoBuffer;
use crate::spin::SpinLock;

const TAKE_SPIN_COUNT: u32 = 64;
const TAKE_YIELD_COUNT: u32 = 192;
const TAKE_SLEEP: Duration = Duration::from_micros(10);

/// Buffer pool for one chip.
///
/// Filled buffers are keyed by the packet id of their chunk; the map's
/// ordering restores original stream order on the consumer side. A buffer
/// is owned by exactly one holder at any time: the free list, the filled
/// map, the reader (filling) or the analyser (draining). `finished` is
/// monotonic; once set and the filled map has drained, consumers see the
/// end of the stream.
#[derive(Debug)]
pub struct BufferPool {
    filled: SpinLock<BTreeMap<u64, VecDeque<IoBuffer>>>,
    free: SpinLock<Vec<IoBuffer>>,
    finished: AtomicBool,
    buffer_size: usize,
}

impl BufferPool {
    /// Pool handing out buffers of `buffer_size` bytes, with `prealloc`
    /// buffers allocated up front.
    pub fn new(buffer_size: usize, prealloc: usize) -> Self {
        let free = (0..prealloc).map(|_| IoBuffer::new(buffer_size)).collect();
        Self {
            filled: SpinLock::new(BTreeMap::new()),
            free: SpinLock::new(free),
            finished: AtomicBool::new(false),
            buffer_size,
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take an empty buffer from the free list, allocating a fresh one when
    /// the list is dry. The result always has `content_size == 0`.
    pub fn acquire_empty(&self) -> IoBuffer {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => IoBuffer::new(self.buffer_size),
        }
    }

    /// Hand a filled buffer to the consumer side, keyed by packet id.
    /// Pieces of one chunk arrive in fill order and keep it in the queue
    /// behind the key.
    pub fn submit_filled(&self, packet_id: u64, buf: IoBuffer) {
        self.filled
            .lock()
            .entry(packet_id)
            .or_default()
            .push_back(buf);
    }

    /// Take the filled buffer with the smallest packet id, blocking while
    /// the pool is empty and not finished.
    ///
    /// Waiting backs off in stages (spin, yield, sleep). Returns `None`
    /// only after `finish()` once every submitted buffer was consumed; a
    /// buffer submitted before `finish()` is never lost because the map is
    /// re-checked before the finished flag on every pass.
    pub fn take_filled(&self) -> Option<(u64, IoBuffer)> {
        let mut attempts: u32 = 0;
        loop {
            {
                let mut filled = self.filled.lock();
                if let Some(mut entry) = filled.first_entry() {
                    let packet_id = *entry.key();
                    let queue = entry.get_mut();
                    let buf = queue.pop_front();
                    if queue.is_empty() {
                        entry.remove();
                    }
                    if let Some(buf) = buf {
                        return Some((packet_id, buf));
                    }
                } else if self.finished.load(Ordering::Acquire) {
                    return None;
                }
            }

            attempts = attempts.saturating_add(1);
            if attempts < TAKE_SPIN_COUNT {
                std::hint::spin_loop();
            } else if attempts < TAKE_YIELD_COUNT {
                std::thread::yield_now();
            } else {
                std::thread::sleep(TAKE_SLEEP);
            }
        }
    }

    /// Return a drained buffer to the free list.
    pub fn release(&self, mut buf: IoBuffer) {
        buf.clear();
        self.free.lock().push(buf);
    }

    /// Signal that no more data is coming. Irreversible.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
