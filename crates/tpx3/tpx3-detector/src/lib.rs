//! Detector description: chip layout, pixel addressing, time and TOT
//! regions of interest, and the pixel to energy-point mapping.

pub mod detector;
pub mod layout;
pub mod pixel_map;

pub use detector::Detector;
pub use layout::{CHIP_SIZE, ChipPosition, DetectorLayout, PIXELS_PER_CHIP, PixelIndex};
pub use pixel_map::{EpPart, PixelMap, PixelMapError};
