use crate::layout::DetectorLayout;
use crate::pixel_map::PixelMap;

/// Constant detector data shared by the analysis and aggregation stages.
///
/// The time region of interest selects which part of each period interval
/// is histogrammed: `value` (relative TOA in TOA mode, TOT otherwise) maps
/// to bin `(value - troi_start) / troi_step` when it falls inside
/// `[troi_start, troi_end)`.
#[derive(Debug, Clone)]
pub struct Detector {
    pub layout: DetectorLayout,

    /// Bin by relative TOA when true, by TOT otherwise.
    pub toa_mode: bool,

    /// TOT acceptance gate, exclusive on both ends.
    pub tot_roi_start: u64,
    pub tot_roi_end: u64,

    /// ROI start offset in clock ticks relative to the interval start.
    pub troi_start: u64,
    /// Histogram bin width in clock ticks.
    pub troi_step: u64,
    /// Number of histogram bins.
    pub troi_n: u64,
    /// Derived: `troi_start + troi_step * troi_n`.
    pub troi_end: u64,

    pub energy_points: PixelMap,
}

impl Detector {
    pub fn new(layout: DetectorLayout) -> Self {
        let num_chips = layout.num_chips();
        let mut det = Self {
            layout,
            toa_mode: true,
            tot_roi_start: 0,
            tot_roi_end: 64_000,
            troi_start: 0,
            troi_step: 1,
            troi_n: 5000,
            troi_end: 0,
            energy_points: PixelMap::empty(num_chips),
        };
        det.set_time_roi(det.troi_start, det.troi_step, det.troi_n);
        det
    }

    /// Set the time region of interest. Values are in 1.5625 ns ticks.
    pub fn set_time_roi(&mut self, start: u64, step: u64, n: u64) {
        self.troi_start = start;
        self.troi_step = step.max(1);
        self.troi_n = n;
        self.troi_end = start + self.troi_step * n;
    }

    #[inline]
    pub fn num_chips(&self) -> usize {
        self.layout.num_chips()
    }

    /// Flat length of one spectra buffer: `troi_n * npoints`.
    #[inline]
    pub fn spectra_len(&self) -> usize {
        self.troi_n as usize * self.energy_points.npoints() as usize
    }
}
