//! Aligned IO buffer for partial raw-stream chunk data.

use std::sync::atomic::{AtomicU32, Ordering};

/// Buffer alignment in bytes (256 bits, AVX2-friendly).
pub const BUFFER_ALIGNMENT: usize = 32;

/// One alignment-sized block of the backing store. Allocating the store as
/// a `Vec` of these guarantees the first byte sits on a 32-byte boundary.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy)]
struct AlignedBlock([u8; BUFFER_ALIGNMENT]);

/// Id for the next buffer; ids are stable for the buffer's lifetime and
/// only serve log readability.
static NEXT_ID: AtomicU32 = AtomicU32::new(0);

/// Byte buffer holding a slice of one raw event data chunk.
///
/// A chunk larger than the buffer capacity is split across several buffers;
/// `content_offset` records where this piece starts within the chunk and
/// `chunk_size` the total chunk byte count, so the consumer can account for
/// chunk boundaries without reassembling. Buffers move between the reader,
/// the pool and one analyser; they are never copied.
#[derive(Debug)]
pub struct IoBuffer {
    blocks: Vec<AlignedBlock>,
    capacity: usize,
    /// Number of valid bytes.
    pub content_size: usize,
    /// Byte offset of this piece within its chunk.
    pub content_offset: u64,
    /// Total byte size of the chunk this piece belongs to.
    pub chunk_size: u64,
    id: u32,
}

impl IoBuffer {
    /// Allocate an empty buffer of at least `capacity` bytes, rounded up to
    /// whole alignment blocks.
    pub fn new(capacity: usize) -> Self {
        let nblocks = capacity.div_ceil(BUFFER_ALIGNMENT).max(1);
        Self {
            blocks: vec![AlignedBlock([0; BUFFER_ALIGNMENT]); nblocks],
            capacity: nblocks * BUFFER_ALIGNMENT,
            content_size: 0,
            content_offset: 0,
            chunk_size: 0,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The valid content, `content_size` bytes.
    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.raw()[..self.content_size]
    }

    /// The whole backing store for filling; the writer bumps
    /// `content_size` afterwards.
    #[inline]
    pub fn space(&mut self) -> &mut [u8] {
        let len = self.capacity;
        // SAFETY: the backing Vec owns `len` contiguous initialized bytes;
        // AlignedBlock is a plain byte array with no padding
        unsafe { std::slice::from_raw_parts_mut(self.blocks.as_mut_ptr().cast::<u8>(), len) }
    }

    /// Drop the content; capacity and id are retained for reuse.
    #[inline]
    pub fn clear(&mut self) {
        self.content_size = 0;
        self.content_offset = 0;
        self.chunk_size = 0;
    }

    #[inline]
    fn raw(&self) -> &[u8] {
        // SAFETY: same layout argument as in `space`
        unsafe { std::slice::from_raw_parts(self.blocks.as_ptr().cast::<u8>(), self.capacity) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_store_is_aligned() {
        for capacity in [1, 8, 1024, 4096] {
            let mut buf = IoBuffer::new(capacity);
            assert_eq!(buf.space().as_ptr() as usize % BUFFER_ALIGNMENT, 0);
            assert!(buf.capacity() >= capacity);
            assert_eq!(buf.capacity() % BUFFER_ALIGNMENT, 0);
        }
    }

    #[test]
    fn content_window_follows_content_size() {
        let mut buf = IoBuffer::new(64);
        buf.space()[..3].copy_from_slice(&[1, 2, 3]);
        buf.content_size = 3;
        assert_eq!(buf.content(), &[1, 2, 3]);

        buf.clear();
        assert!(buf.content().is_empty());
        assert_eq!(buf.chunk_size, 0);
    }

    #[test]
    fn ids_are_distinct() {
        let a = IoBuffer::new(8);
        let b = IoBuffer::new(8);
        assert_ne!(a.id(), b.id());
    }
}
