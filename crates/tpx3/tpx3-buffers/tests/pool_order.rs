//! Concurrent producer/consumer test for the buffer pool.
//!
//! One thread plays the reader (submitting buffers with ascending packet
//! ids), another plays the analyser (blocking takes until the end
//! sentinel). The consumer must observe every buffer exactly once, in
//! ascending packet-id order, while both threads race on the pool's locks.

use std::sync::Arc;
use std::thread;

use tpx3_buffers::BufferPool;

const PACKETS: u64 = 2_000;
const PIECES_PER_PACKET: usize = 3;

#[test]
fn concurrent_consumption_preserves_packet_order() {
    let pool = Arc::new(BufferPool::new(64, 8));

    let producer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            for packet_id in 0..PACKETS {
                for piece in 0..PIECES_PER_PACKET {
                    let mut buf = pool.acquire_empty();
                    assert_eq!(buf.content_size, 0, "empty buffer has content");
                    let payload = packet_id.to_le_bytes();
                    buf.space()[..8].copy_from_slice(&payload);
                    buf.content_size = 8;
                    buf.content_offset = (piece * 8) as u64;
                    buf.chunk_size = (PIECES_PER_PACKET * 8) as u64;
                    pool.submit_filled(packet_id, buf);
                }
            }
            pool.finish();
        })
    };

    let consumer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let mut last_id = 0u64;
            let mut count = 0usize;
            while let Some((packet_id, buf)) = pool.take_filled() {
                assert!(
                    packet_id >= last_id,
                    "packet {packet_id} delivered after {last_id}"
                );
                let stamped = u64::from_le_bytes(buf.content()[..8].try_into().unwrap());
                assert_eq!(stamped, packet_id);
                last_id = packet_id;
                count += 1;
                pool.release(buf);
            }
            count
        })
    };

    producer.join().unwrap();
    let consumed = consumer.join().unwrap();
    assert_eq!(consumed, PACKETS as usize * PIECES_PER_PACKET);

    // the sentinel repeats once the pool has drained
    assert!(pool.take_filled().is_none());
}
