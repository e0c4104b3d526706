/// Aggregated pipeline counters, folded in by each thread at exit.
///
/// Spin time is spent waiting for buffers (the reader waits for free ones,
/// the analysers for filled ones); work time is everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    /// Pixel hits processed after the predictor became ready.
    pub hits: u64,
    /// Hits dropped during predictor warm-up.
    pub skipped_hits: u64,
    /// TDC pulses seen across all chips.
    pub tdcs: u64,
    pub read_time: f64,
    pub read_spin_time: f64,
    pub analyse_time: f64,
    pub analyse_spin_time: f64,
}

impl RunStats {
    /// Hit rate over `elapsed` seconds of wall time.
    pub fn hit_rate(&self, elapsed: f64) -> f64 {
        if elapsed > 0.0 {
            self.hits as f64 / elapsed
        } else {
            0.0
        }
    }
}
