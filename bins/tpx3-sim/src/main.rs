//! Synthetic Timepix3 raw-stream source.
//!
//! Stands in for the detector server's data output during development and
//! testing: connects to a listening `xestream` instance and either
//! generates a periodic TDC/hit stream or replays a raw capture file,
//! framing everything with packet ids the way a >= 3.2.0 server does.

mod words;

use std::fs::File;
use std::io::{self, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tpx3_decode as decode;

#[derive(Parser, Debug)]
#[command(name = "tpx3-sim", version)]
struct Cli {
    /// Listening raw-stream consumer to connect to
    #[arg(short, long, default_value = "127.0.0.1:8451")]
    connect: String,

    /// Number of detector chips to simulate
    #[arg(long, default_value_t = 3)]
    chips: u8,

    /// TDC periods to generate
    #[arg(long, default_value_t = 100)]
    periods: u64,

    /// Pixel hits per period per chip
    #[arg(long, default_value_t = 10)]
    hits_per_period: u64,

    /// TDC interval in 640 MHz clock ticks
    #[arg(long, default_value_t = 640_000)]
    interval: i64,

    /// Replay a raw capture file instead of generating
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Log filter
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    info!(connect = %cli.connect, "connecting");
    let mut stream = TcpStream::connect(&cli.connect)?;

    let sent = match &cli.replay {
        Some(path) => replay_capture(&mut stream, path)?,
        None => generate(&mut stream, &cli)?,
    };
    info!(bytes = sent, "stream finished");
    Ok(())
}

/// Generate `periods` TDC intervals per chip with uniformly spread hits
/// kept clear of the dispute bands around the interval boundaries.
fn generate(out: &mut impl Write, cli: &Cli) -> io::Result<u64> {
    let mut packet_id = 0u64;
    let mut sent = 0u64;

    for period in 0..cli.periods {
        let start = period as i64 * cli.interval;
        for chip in 0..cli.chips {
            let mut payload = Vec::with_capacity(1 + cli.hits_per_period as usize);
            payload.push(words::tdc(start));
            for k in 0..cli.hits_per_period {
                let toa = start + hit_offset(cli.interval, cli.hits_per_period, k);
                let x = ((period * 37 + k * 11 + chip as u64 * 53) % 256) as u16;
                let y = ((period * 17 + k * 7) % 256) as u16;
                payload.push(words::hit(x, y, toa, 100 + k % 32));
            }
            let frame = words::frame(chip, packet_id, &payload);
            out.write_all(&frame)?;
            sent += frame.len() as u64;
            packet_id += 1;
        }
    }
    out.flush()?;
    Ok(sent)
}

/// Spread hit `k` of `n` over the middle 80% of the interval.
fn hit_offset(interval: i64, n: u64, k: u64) -> i64 {
    let base = interval / 10;
    let span = interval - 2 * base;
    base + span * (k as i64 + 1) / (n as i64 + 1)
}

/// Replay a capture of `[header][payload]` chunks, re-framing each chunk
/// with a fresh packet id and the matching size field.
fn replay_capture(out: &mut impl Write, path: &PathBuf) -> Result<u64, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    // SAFETY: the capture file is only read and not modified while mapped
    let map = unsafe { memmap2::Mmap::map(&file)? };
    let data = &map[..];

    let mut pos = 0usize;
    let mut packet_id = 0u64;
    let mut sent = 0u64;
    while pos + 8 <= data.len() {
        let header = u64::from_le_bytes(std::array::from_fn(|i| data[pos + i]));
        if !decode::is_chunk_header(header) {
            return Err(format!("unknown header at offset {pos}").into());
        }
        let payload = decode::chunk_size_bytes(header) as usize;
        pos += 8;
        if pos + payload > data.len() {
            return Err(format!("truncated chunk at offset {pos}").into());
        }

        // captures predate packet ids; grow the size field accordingly
        let reframed = (payload as u64 + 8) << 48 | header & 0x0000_ffff_ffff_ffff;
        out.write_all(&reframed.to_le_bytes())?;
        out.write_all(&words::packet_word(packet_id).to_le_bytes())?;
        out.write_all(&data[pos..pos + payload])?;
        sent += 16 + payload as u64;
        pos += payload;
        packet_id += 1;
    }
    out.flush()?;
    info!(chunks = packet_id, "capture replayed");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_offsets_stay_clear_of_dispute_bands() {
        let interval = 640_000;
        for n in [1u64, 10, 100] {
            for k in 0..n {
                let off = hit_offset(interval, n, k);
                assert!(off > interval / 10, "hit {k}/{n} too close to start");
                assert!(off < interval * 9 / 10, "hit {k}/{n} too close to end");
            }
        }
    }

    #[test]
    fn generated_stream_frames_parse() {
        let cli = Cli {
            connect: String::new(),
            chips: 2,
            periods: 3,
            hits_per_period: 4,
            interval: 640_000,
            replay: None,
            log_level: String::new(),
        };
        let mut bytes = Vec::new();
        let sent = generate(&mut bytes, &cli).unwrap();
        assert_eq!(sent as usize, bytes.len());

        // walk the frames: header, packet id, payload words
        let mut pos = 0;
        let mut frames = 0;
        while pos < bytes.len() {
            let header = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
            assert!(decode::is_chunk_header(header));
            let chunk = decode::chunk_size_bytes(header) as usize;
            let id = u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
            assert!(decode::matches_byte(id, decode::PACKET_ID_BYTE));
            assert_eq!(decode::packet_id(id), frames);
            pos += 8 + chunk;
            frames += 1;
        }
        assert_eq!(pos, bytes.len());
        assert_eq!(frames, 6);
    }
}
