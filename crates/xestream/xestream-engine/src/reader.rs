//! Raw-stream reader thread.

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use tpx3_buffers::BufferPool;
use tpx3_core::{RunContext, Timer};
use tpx3_decode as decode;

use crate::stats::RunStats;

/// Event data starts after the packet-id word; the header's chunk size
/// field covers packet id plus payload (server version >= 3.2.0).
const DATA_OFFSET: u64 = 8;

/// Receive timeout; timeouts are swallowed and retried so the stop flag
/// stays responsive during stalls.
const READ_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
enum ReadError {
    #[error("chunk header expected, got {word:#018x}")]
    BadChunkHeader { word: u64 },

    #[error("packet id expected, got {word:#018x}")]
    BadPacketId { word: u64 },

    #[error("chunk for unknown chip {chip}")]
    UnknownChip { chip: u8 },

    #[error("unable to read packet header, got {got} of {want} bytes")]
    ShortHeader { got: usize, want: usize },

    #[error("no bytes received inside chunk")]
    ShortChunk,

    #[error("empty buffer has content")]
    DirtyBuffer,

    #[error("receive failed")]
    Io(#[from] io::Error),
}

enum Outcome {
    /// Clean connection shutdown at a packet boundary.
    EndOfStream,
    /// Cooperative stop.
    Stopped,
}

pub(crate) struct Reader<'a> {
    stream: TcpStream,
    pools: &'a [BufferPool],
    ctx: &'a RunContext,
    work_time: f64,
    spin_time: f64,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(stream: TcpStream, pools: &'a [BufferPool], ctx: &'a RunContext) -> Self {
        Self {
            stream,
            pools,
            ctx,
            work_time: 0.0,
            spin_time: 0.0,
        }
    }

    /// Read packets until end of stream, a stop request or a fatal error.
    /// Always finishes every chip pool on the way out.
    pub(crate) fn run(mut self, stats: &Mutex<RunStats>) {
        if let Err(err) = self.stream.set_read_timeout(Some(READ_TIMEOUT)) {
            self.ctx.fail(format!("reader: {err}"));
        } else {
            match self.read_packets() {
                Ok(Outcome::EndOfStream) => {
                    debug!("reader: graceful connection shutdown detected");
                }
                Ok(Outcome::Stopped) => {}
                Err(err) => self.ctx.fail(format!("reader: {err}")),
            }
        }

        for pool in self.pools {
            pool.finish();
        }

        let mut totals = stats.lock().unwrap_or_else(|e| e.into_inner());
        totals.read_time += self.work_time;
        totals.read_spin_time += self.spin_time;
        drop(totals);

        debug!("reader stopped");
    }

    fn read_packets(&mut self) -> Result<Outcome, ReadError> {
        loop {
            if self.ctx.stop_requested() {
                return Ok(Outcome::Stopped);
            }

            let mut header = [0u8; 16];
            let mut timer = Timer::start();
            let got = self.fill(&mut header, true)?;
            if got == 0 {
                return Ok(Outcome::EndOfStream);
            }
            if got < header.len() {
                // fill only comes back short here on a stop request
                return Ok(Outcome::Stopped);
            }
            self.work_time += timer.elapsed();

            let head = u64::from_le_bytes(std::array::from_fn(|i| header[i]));
            let id_word = u64::from_le_bytes(std::array::from_fn(|i| header[i + 8]));
            if !decode::is_chunk_header(head) {
                return Err(ReadError::BadChunkHeader { word: head });
            }
            if !decode::matches_byte(id_word, decode::PACKET_ID_BYTE) {
                return Err(ReadError::BadPacketId { word: id_word });
            }
            let chip = decode::chunk_chip_index(head);
            let chunk_size = decode::chunk_size_bytes(head);
            let packet_id = decode::packet_id(id_word);
            if chip as usize >= self.pools.len() {
                return Err(ReadError::UnknownChip { chip });
            }

            let pool = &self.pools[chip as usize];
            let mut total = DATA_OFFSET;
            while total < chunk_size {
                timer.set();
                let mut buf = pool.acquire_empty();
                if buf.content_size != 0 {
                    return Err(ReadError::DirtyBuffer);
                }
                self.spin_time += timer.elapsed();
                timer.set();

                buf.content_offset = total;
                buf.chunk_size = chunk_size;
                let want = buf.capacity().min((chunk_size - total) as usize);
                let got = self.fill(&mut buf.space()[..want], false)?;
                if got < want {
                    // stop requested mid-chunk; hand over whole words only
                    buf.content_size = got - got % 8;
                    if buf.content_size > 0 {
                        pool.submit_filled(packet_id, buf);
                    } else {
                        pool.release(buf);
                    }
                    return Ok(Outcome::Stopped);
                }
                buf.content_size = want;
                total += want as u64;
                pool.submit_filled(packet_id, buf);
                self.work_time += timer.elapsed();

                if self.ctx.stop_requested() {
                    return Ok(Outcome::Stopped);
                }
            }
        }
    }

    /// Fill `buf` completely, retrying timeouts. Returns the byte count
    /// actually read: short only on clean EOF with `allow_eof` and nothing
    /// read yet, or on a stop request.
    fn fill(&mut self, buf: &mut [u8], allow_eof: bool) -> Result<usize, ReadError> {
        let mut read = 0;
        while read < buf.len() {
            match self.stream.read(&mut buf[read..]) {
                Ok(0) => {
                    if read == 0 && allow_eof {
                        return Ok(0);
                    }
                    if allow_eof {
                        return Err(ReadError::ShortHeader {
                            got: read,
                            want: buf.len(),
                        });
                    }
                    return Err(ReadError::ShortChunk);
                }
                Ok(n) => read += n,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    if self.ctx.stop_requested() {
                        return Ok(read);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(ReadError::Io(err)),
            }
        }
        Ok(read)
    }
}
