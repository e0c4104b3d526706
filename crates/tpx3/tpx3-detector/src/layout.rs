use serde::{Deserialize, Serialize};

/// Side length of one chip in pixels.
pub const CHIP_SIZE: u32 = 256;

/// Pixels per chip; flat pixel indices run 0..PIXELS_PER_CHIP.
pub const PIXELS_PER_CHIP: u32 = CHIP_SIZE * CHIP_SIZE;

/// Position of one chip within the detector plane, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipPosition {
    pub x: u32,
    pub y: u32,
}

/// Physical arrangement of the detector's chips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorLayout {
    pub width: u32,
    pub height: u32,
    pub chips: Vec<ChipPosition>,
}

impl DetectorLayout {
    /// Chips side by side in a single row. Used when the control plane only
    /// reports a chip count.
    pub fn row(num_chips: usize) -> Self {
        Self {
            width: CHIP_SIZE * num_chips as u32,
            height: CHIP_SIZE,
            chips: (0..num_chips)
                .map(|i| ChipPosition {
                    x: i as u32 * CHIP_SIZE,
                    y: 0,
                })
                .collect(),
        }
    }

    #[inline]
    pub fn num_chips(&self) -> usize {
        self.chips.len()
    }
}

/// Chip number plus flat pixel index within that chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelIndex {
    pub chip: u32,
    pub flat_pixel: u32,
}

impl PixelIndex {
    /// Index for a decoded coordinate pair.
    #[inline]
    pub fn from_xy(chip: u32, xy: (u16, u16)) -> Self {
        Self {
            chip,
            flat_pixel: xy.0 as u32 * CHIP_SIZE + xy.1 as u32,
        }
    }

    #[inline]
    pub fn from_flat(chip: u32, flat_pixel: u32) -> Self {
        Self { chip, flat_pixel }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_layout_spans_chips() {
        let layout = DetectorLayout::row(4);
        assert_eq!(layout.num_chips(), 4);
        assert_eq!(layout.width, 1024);
        assert_eq!(layout.chips[3], ChipPosition { x: 768, y: 0 });
    }

    #[test]
    fn flat_pixel_is_column_major() {
        assert_eq!(PixelIndex::from_xy(1, (0, 0)).flat_pixel, 0);
        assert_eq!(PixelIndex::from_xy(1, (1, 0)).flat_pixel, 256);
        assert_eq!(PixelIndex::from_xy(1, (255, 255)).flat_pixel, PIXELS_PER_CHIP - 1);
    }
}
