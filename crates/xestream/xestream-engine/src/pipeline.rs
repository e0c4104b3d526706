//! Pipeline wiring: buffer pools, analyser threads, reader.

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use tpx3_buffers::BufferPool;
use tpx3_core::RunContext;
use tpx3_detector::Detector;
use tpx3_spectra::Aggregator;

use crate::analyser::{Analyser, AnalyserSettings};
use crate::reader::Reader;
use crate::stats::RunStats;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// IO buffer byte size; must be a multiple of 8.
    pub buffer_size: usize,
    /// Buffers preallocated per chip pool.
    pub num_buffers: usize,
    /// Assumed TDC interval in clock ticks until the predictor locks on.
    pub initial_period: i64,
    /// Dispute band width as a fraction of the interval.
    pub threshold: f64,
    /// Recent period boundaries retained per chip.
    pub max_period_queues: usize,
}

/// One acquisition run: a reader plus one analyser per chip over a
/// connected raw data stream. The aggregator (and its writer thread) is
/// owned by the caller and outlives the run.
pub struct Pipeline {
    config: PipelineConfig,
    detector: Arc<Detector>,
    aggregator: Arc<Aggregator>,
    ctx: Arc<RunContext>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<Detector>,
        aggregator: Arc<Aggregator>,
        ctx: Arc<RunContext>,
    ) -> Self {
        Self {
            config,
            detector,
            aggregator,
            ctx,
        }
    }

    /// Run to end of stream (or stop request / fatal error) and drain.
    /// Fatal errors are recorded in the run context.
    pub fn run(&self, stream: TcpStream) -> RunStats {
        let num_chips = self.detector.num_chips();
        let pools: Vec<BufferPool> = (0..num_chips)
            .map(|_| BufferPool::new(self.config.buffer_size, self.config.num_buffers))
            .collect();
        let settings = AnalyserSettings {
            initial_period: self.config.initial_period,
            threshold: self.config.threshold,
            max_period_queues: self.config.max_period_queues,
        };
        let ready = AtomicUsize::new(0);
        let stats = Mutex::new(RunStats::default());

        debug!(
            num_chips,
            buffer_size = self.config.buffer_size,
            initial_period = self.config.initial_period,
            "pipeline starting"
        );

        std::thread::scope(|scope| {
            for (chip, pool) in pools.iter().enumerate() {
                let analyser = Analyser::new(
                    chip,
                    pool,
                    self.detector.as_ref(),
                    self.aggregator.as_ref(),
                    self.ctx.as_ref(),
                    &settings,
                );
                let ready = &ready;
                let stats = &stats;
                scope.spawn(move || analyser.run(ready, stats));
            }

            // the reader only starts once every analyser is consuming
            while ready.load(Ordering::Acquire) != num_chips {
                std::thread::yield_now();
            }
            Reader::new(stream, &pools, self.ctx.as_ref()).run(&stats);
        });

        stats.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}
