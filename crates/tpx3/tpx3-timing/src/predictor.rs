//! Per-chip TDC interval prediction.
//!
//! The predictor keeps the four most recent `(timestamp, period)` samples in
//! a ring and derives the inter-TDC interval as the median of the adjacent
//! sample slopes, which makes the estimate robust against a single late or
//! early TDC pulse. Every accepted TDC re-anchors the linear prediction at
//! the observed pulse; `correction` preserves absolute period numbering
//! across anchor moves.

/// Number of TDC pulses that must be seen before predictions are valid.
pub const MIN_TDC_SAMPLES: u64 = 3;

const RING: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Sample {
    ts: i64,
    p: f64,
}

/// Median-of-slopes interval predictor over a ring of 4 TDC samples.
#[derive(Debug, Clone)]
pub struct PeriodPredictor {
    /// Past samples in ring order; `head` is the oldest (next overwritten).
    past: [Sample; RING],
    head: usize,
    /// Reference timestamp of the linear prediction.
    start: i64,
    /// Clock ticks per period. Positive for any plausible sample history.
    interval: f64,
    /// Integer period number at `start`.
    correction: i64,
}

/// Period assignment rounding: half-way cases resolve downwards, so a TDC
/// sitting exactly between two predicted boundaries extends the current
/// period instead of opening the next one.
#[inline]
fn round_period(x: f64) -> i64 {
    (x - 0.5).ceil() as i64
}

impl PeriodPredictor {
    /// New predictor anchored at `start` with an assumed `interval`.
    pub fn new(start: i64, interval: i64) -> Self {
        let mut p = Self {
            past: [Sample { ts: 0, p: 0.0 }; RING],
            head: 0,
            start,
            interval: interval as f64,
            correction: 0,
        };
        p.reset(start, interval);
        p
    }

    /// Re-anchor at `start` with the given `interval` and back-fill the ring
    /// with synthetic samples `(start - i*interval, -i)` so the slope median
    /// is well defined from the first real TDC on.
    pub fn reset(&mut self, start: i64, interval: i64) {
        self.start = start;
        self.interval = interval as f64;
        self.correction = 0;
        self.head = 0;
        for (i, slot) in self.past.iter_mut().enumerate() {
            let age = (RING - 1 - i) as i64;
            *slot = Sample {
                ts: start - age * interval,
                p: -(age as f64),
            };
        }
    }

    /// Current interval estimate in clock ticks per period.
    #[inline]
    pub fn interval_prediction(&self) -> f64 {
        self.interval
    }

    /// Fractional period number predicted for timestamp `ts`.
    #[inline]
    pub fn period_prediction(&self, ts: i64) -> f64 {
        (ts - self.start) as f64 / self.interval + self.correction as f64
    }

    /// Fold an observed TDC pulse into the ring, re-derive the interval and
    /// re-anchor the prediction at the pulse.
    pub fn prediction_update(&mut self, ts: i64) {
        let p = round_period(self.period_prediction(ts));
        self.past[self.head] = Sample { ts, p: p as f64 };
        self.head = (self.head + 1) % RING;
        self.interval = self.predict_interval();
        self.start = ts;
        self.correction = p;
    }

    /// Move the reference timestamp, folding the jump into `correction` so
    /// absolute period numbers are preserved.
    pub fn start_update(&mut self, new_start: i64) {
        self.correction += round_period((new_start - self.start) as f64 / self.interval);
        self.start = new_start;
        self.interval = self.predict_interval();
    }

    /// Bound test for whether `ts` is close enough to the predicted period
    /// boundary; a failing test warrants a `start_update`.
    pub fn in_sync(&self, ts: i64) -> bool {
        let predicted = self.period_prediction(ts).round();
        let boundary = self.start as f64 + predicted * self.interval;
        (ts as f64 - boundary).abs() <= 0.5 * self.interval
    }

    /// Median of the three adjacent-sample slopes, in ring order oldest to
    /// newest. Degenerate pairs (equal period numbers) sort to the end under
    /// `total_cmp` and cannot become the median.
    fn predict_interval(&self) -> f64 {
        let mut diff = [0.0f64; RING - 1];
        for (k, d) in diff.iter_mut().enumerate() {
            let l = self.past[(self.head + k) % RING];
            let h = self.past[(self.head + k + 1) % RING];
            *d = (h.ts - l.ts) as f64 / (h.p - l.p);
        }
        diff.sort_unstable_by(f64::total_cmp);
        diff[(RING - 1) / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_defines_interval_and_period() {
        let mut p = PeriodPredictor::new(0, 2);
        assert_eq!(p.interval_prediction(), 2.0);
        assert_eq!(p.period_prediction(6), 3.0);

        p.reset(1, 2);
        assert_eq!(p.interval_prediction(), 2.0);
        assert_eq!(p.period_prediction(5), 2.0);
    }

    #[test]
    fn updates_track_a_drifted_interval() {
        let mut p = PeriodPredictor::new(0, 2);
        p.prediction_update(5);
        p.prediction_update(8);
        p.prediction_update(11);
        assert_eq!(p.interval_prediction(), 3.0);
        assert_eq!(p.period_prediction(14), 5.0);
    }

    #[test]
    fn start_update_preserves_absolute_numbering() {
        let mut p = PeriodPredictor::new(0, 2);
        p.start_update(2);
        assert_eq!(p.interval_prediction(), 2.0);
        assert_eq!(p.period_prediction(6), 3.0);
    }

    #[test]
    fn in_sync_accepts_on_boundary_and_flags_anchor_drift() {
        let p = PeriodPredictor::new(0, 2);
        assert!(p.in_sync(4));
        assert!(p.in_sync(5));

        let mut q = PeriodPredictor::new(0, 2);
        q.start_update(2);
        // correction is now 1, so the predicted boundary for ts=6 sits at 8
        assert!(!q.in_sync(6));
    }

    #[test]
    fn interval_stays_positive_under_jitter() {
        let mut p = PeriodPredictor::new(0, 640_000);
        let mut ts = 0i64;
        for i in 0..64 {
            ts += 640_000 + [13, -20, 7, -4][i % 4];
            p.prediction_update(ts);
            assert!(p.interval_prediction() > 0.0);
        }
        let est = p.interval_prediction();
        assert!((est - 640_000.0).abs() < 50.0);
    }

    #[test]
    fn consecutive_periods_number_consecutively() {
        let mut p = PeriodPredictor::new(0, 1000);
        for k in 1..=5 {
            p.prediction_update(k * 1000);
            assert_eq!(p.period_prediction((k + 1) * 1000), (k + 1) as f64);
        }
    }
}
