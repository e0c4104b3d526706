//! Per-chip analyser thread.
//!
//! Consumes the chip's filled buffers in packet-id order, decodes raw
//! words, drives the period predictor and period queues, and commits
//! events into the aggregator. The first TDC seeds the predictor with the
//! configured initial interval; hits arriving before three TDCs were seen
//! are dropped because no reliable period can be assigned to them.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{debug, info, trace};

use tpx3_buffers::{BufferPool, IoBuffer};
use tpx3_core::{Period, RunContext, Timer};
use tpx3_decode::{self as decode, DecodeError};
use tpx3_detector::{Detector, PixelIndex};
use tpx3_spectra::{Aggregator, AggregatorError, SlotCache};
use tpx3_timing::{MIN_TDC_SAMPLES, PeriodIndex, PeriodPredictor, PeriodQueues};

#[derive(Debug, Error)]
enum AnalyseError {
    #[error("encountered chunk header within chunk at offset {offset}")]
    ChunkHeaderInChunk { offset: u64 },

    #[error("encountered packet id within chunk at offset {offset}")]
    PacketIdInChunk { offset: u64 },

    #[error("buffer holds {size} bytes, not a whole number of words")]
    TornWord { size: usize },

    #[error("undisputed period {period} for tdc at {tdcclk}")]
    UndisputedTdc { tdcclk: i64, period: f64 },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

pub(crate) struct AnalyserSettings {
    pub initial_period: i64,
    pub threshold: f64,
    pub max_period_queues: usize,
}

pub(crate) struct Analyser<'a> {
    chip: usize,
    pool: &'a BufferPool,
    detector: &'a Detector,
    aggregator: &'a Aggregator,
    ctx: &'a RunContext,
    predictor: PeriodPredictor,
    queues: PeriodQueues,
    cache: SlotCache,
    initial_period: i64,
    max_period_queues: usize,
    tdc_hits: u64,
    hits: u64,
    skipped: u64,
}

impl<'a> Analyser<'a> {
    pub(crate) fn new(
        chip: usize,
        pool: &'a BufferPool,
        detector: &'a Detector,
        aggregator: &'a Aggregator,
        ctx: &'a RunContext,
        settings: &AnalyserSettings,
    ) -> Self {
        Self {
            chip,
            pool,
            detector,
            aggregator,
            ctx,
            predictor: PeriodPredictor::new(0, settings.initial_period),
            queues: PeriodQueues::new(settings.threshold),
            cache: SlotCache::new(),
            initial_period: settings.initial_period,
            max_period_queues: settings.max_period_queues,
            tdc_hits: 0,
            hits: 0,
            skipped: 0,
        }
    }

    /// Thread body. Signals readiness, drains the pool to the end sentinel
    /// and flushes the remaining periods on the way out.
    pub(crate) fn run(
        mut self,
        ready: &AtomicUsize,
        stats: &Mutex<crate::stats::RunStats>,
    ) {
        ready.fetch_add(1, Ordering::Release);

        let mut spin_time = 0.0;
        let mut work_time = 0.0;
        let mut timer = Timer::start();

        loop {
            timer.set();
            let Some((packet_id, buf)) = self.pool.take_filled() else {
                break;
            };
            spin_time += timer.elapsed();
            timer.set();

            let result = self.process_buffer(&buf);
            self.pool.release(buf);
            work_time += timer.elapsed();

            if let Err(err) = result {
                self.ctx
                    .fail(format!("analyser {}: packet {packet_id}: {err}", self.chip));
                break;
            }
        }

        // flush everything still parked so in-flight periods reach the writer
        if let Err(err) = self.purge_queues(0) {
            self.ctx.fail(format!("analyser {}: flush: {err}", self.chip));
        }

        let mut totals = stats.lock().unwrap_or_else(|e| e.into_inner());
        totals.hits += self.hits;
        totals.skipped_hits += self.skipped;
        totals.tdcs += self.tdc_hits;
        totals.analyse_time += work_time;
        totals.analyse_spin_time += spin_time;
        drop(totals);

        info!(
            chip = self.chip,
            hits = self.hits,
            tdcs = self.tdc_hits,
            skipped = self.skipped,
            "analyser stopped"
        );
    }

    fn process_buffer(&mut self, buf: &IoBuffer) -> Result<(), AnalyseError> {
        let content = buf.content();
        if content.len() % 8 != 0 {
            return Err(AnalyseError::TornWord {
                size: content.len(),
            });
        }

        for (i, bytes) in content.chunks_exact(8).enumerate() {
            let word = u64::from_le_bytes(std::array::from_fn(|k| bytes[k]));
            let offset = buf.content_offset + (i * 8) as u64;

            if decode::is_chunk_header(word) {
                return Err(AnalyseError::ChunkHeaderInChunk { offset });
            } else if decode::matches_nibble(word, decode::HIT_NIBBLE) {
                self.on_hit(word)?;
            } else if decode::matches_nibble(word, decode::TDC_NIBBLE) {
                self.on_tdc(word)?;
            } else if decode::matches_byte(word, decode::PACKET_ID_BYTE) {
                return Err(AnalyseError::PacketIdInChunk { offset });
            } else {
                trace!(chip = self.chip, word, "unknown word");
            }
        }
        Ok(())
    }

    fn on_tdc(&mut self, word: u64) -> Result<(), AnalyseError> {
        let tdcclk = decode::tdc_clock(word)?;

        if self.tdc_hits == 0 {
            self.predictor.reset(tdcclk, self.initial_period);
        } else {
            self.predictor.prediction_update(tdcclk);
        }
        self.tdc_hits += 1;

        if self.tdc_hits < MIN_TDC_SAMPLES {
            return Ok(());
        }

        let period = self.predictor.period_prediction(tdcclk);
        let index = self.queues.period_index_for(period);
        if !index.disputed {
            // a TDC marks a boundary; an undisputed one means the predictor
            // drifted past the dispute window
            return Err(AnalyseError::UndisputedTdc { tdcclk, period });
        }
        if !self.predictor.in_sync(tdcclk) {
            self.predictor.start_update(tdcclk);
            debug!(chip = self.chip, tdcclk, "predictor recalibrated");
        }
        self.process_tdc(&index, tdcclk)
    }

    /// Two-phase commit on TDC arrival: record the period start, then
    /// settle every parked event against it, oldest first.
    fn process_tdc(&mut self, index: &PeriodIndex, tdcclk: i64) -> Result<(), AnalyseError> {
        let mut pending = self.queues.register_start(index, tdcclk);
        while let Some(el) = pending.pop() {
            let period = if tdcclk <= el.toa {
                index.disputed_period
            } else {
                index.period
            };
            self.commit(period, el.toa, el.word)?;
        }
        self.purge_queues(self.max_period_queues)
    }

    fn on_hit(&mut self, word: u64) -> Result<(), AnalyseError> {
        if self.tdc_hits < MIN_TDC_SAMPLES {
            self.skipped += 1;
            return Ok(());
        }

        let toaclk = decode::toa_clock(word);
        let predicted = self.predictor.period_prediction(toaclk);
        let mut index = self.queues.period_index_for(predicted);
        self.queues.refine(&mut index, toaclk);
        self.hits += 1;

        if index.disputed {
            self.queues.enqueue(&index, toaclk, word);
            Ok(())
        } else {
            self.commit(index.period, toaclk, word)
        }
    }

    fn commit(&mut self, period: Period, toaclk: i64, word: u64) -> Result<(), AnalyseError> {
        let start = self.queues.start_of(period);
        let reltoa = toaclk - start;
        let tot = decode::tot_clock(word);
        let pixel = PixelIndex::from_xy(self.chip as u32, decode::xy(word));
        self.aggregator
            .with_data(self.chip, period, &mut self.cache, |data| {
                data.record(self.detector, pixel, reltoa, tot)
            })?;
        Ok(())
    }

    /// Purge tracked boundaries oldest-first down to `target`, handing each
    /// finished period to the aggregator for this chip.
    fn purge_queues(&mut self, target: usize) -> Result<(), AnalyseError> {
        while self.queues.len() > target {
            let Some((period, _)) = self.queues.pop_oldest() else {
                break;
            };
            debug!(chip = self.chip, period, "period purged");
            self.aggregator
                .return_data(self.chip, period, &mut self.cache)?;
        }
        Ok(())
    }
}
