//! Pixel to energy-point mapping.
//!
//! Two serializations produce the identical in-memory structure. The text
//! form has one line per mapped pixel,
//!
//! ```text
//! chip,flat_pixel,ep_0,...,ep_{k-1},w_0,...,w_{k-1}
//! ```
//!
//! with the energy points and weights in two equally long halves. The JSON
//! form is `{"chips": [[{"i": <flat>, "p": [...], "f": [...]}, ...], ...]}`
//! with an optional `"type": "PixelMap"` marker.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::{PIXELS_PER_CHIP, PixelIndex};

/// Maximum byte length of one text-form line.
pub const MAX_LINE_BYTES: usize = 1023;

/// One contribution of a pixel: energy point and weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpPart {
    pub energy_point: u32,
    pub weight: f32,
}

/// Per chip, per flat pixel: the energy points the pixel contributes to.
/// `npoints` is one past the largest mapped energy point.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMap {
    chips: Vec<Vec<Vec<EpPart>>>,
    npoints: u32,
}

#[derive(Debug, Error)]
pub enum PixelMapError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("pixel map line {line} exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong { line: usize },

    #[error("pixel map line {line}: {count} fields, need an even count of at least 2")]
    FieldCount { line: usize, count: usize },

    #[error("pixel map line {line}: invalid number '{field}'")]
    Number { line: usize, field: String },

    #[error("pixel map line {line}: chip {chip} out of range, detector has {num_chips} chips")]
    ChipRange {
        line: usize,
        chip: u32,
        num_chips: usize,
    },

    #[error("pixel map line {line}: pixel {pixel} out of range")]
    PixelRange { line: usize, pixel: u32 },

    #[error("failed to parse pixel map JSON")]
    Json(#[from] sonic_rs::Error),

    #[error("pixel map defines {found} chips, detector has {expected}")]
    ChipCount { expected: usize, found: usize },

    #[error("pixel map chip {chip}: pixel {pixel} out of range")]
    JsonPixel { chip: usize, pixel: u32 },

    #[error("pixel map chip {chip} pixel {pixel}: point and fraction lists differ in length")]
    PartLists { chip: usize, pixel: u32 },
}

#[derive(Serialize, Deserialize)]
struct PixelMapDoc {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    chips: Vec<Vec<PixelEntry>>,
}

#[derive(Serialize, Deserialize)]
struct PixelEntry {
    i: u32,
    p: Vec<u32>,
    f: Vec<f32>,
}

impl PixelMap {
    /// Map with no contributions for any pixel.
    pub fn empty(num_chips: usize) -> Self {
        Self {
            chips: vec![vec![Vec::new(); PIXELS_PER_CHIP as usize]; num_chips],
            npoints: 1,
        }
    }

    /// Load from a file path; `.json` selects the JSON form, anything else
    /// the text form.
    pub fn load(path: impl AsRef<Path>, num_chips: usize) -> Result<Self, PixelMapError> {
        let path = path.as_ref();
        let read_err = |source| PixelMapError::Read {
            path: path.display().to_string(),
            source,
        };
        if path.extension().is_some_and(|e| e == "json") {
            let text = std::fs::read_to_string(path).map_err(read_err)?;
            Self::from_json_str(&text, num_chips)
        } else {
            let file = File::open(path).map_err(read_err)?;
            Self::from_text(BufReader::new(file), num_chips)
        }
    }

    /// Parse the text form. On any error no partial map escapes.
    pub fn from_text(reader: impl BufRead, num_chips: usize) -> Result<Self, PixelMapError> {
        let mut map = Self::empty(num_chips);
        let mut max_point = 0u32;

        for (n, line) in reader.lines().enumerate() {
            let line_no = n + 1;
            let line = line.map_err(|source| PixelMapError::Read {
                path: format!("line {line_no}"),
                source,
            })?;
            if line.len() > MAX_LINE_BYTES {
                return Err(PixelMapError::LineTooLong { line: line_no });
            }
            if line.trim().is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let count = fields.len();
            if count < 2 || count % 2 != 0 {
                return Err(PixelMapError::FieldCount {
                    line: line_no,
                    count,
                });
            }

            let chip: u32 = parse_field(fields[0], line_no)?;
            if chip as usize >= num_chips {
                return Err(PixelMapError::ChipRange {
                    line: line_no,
                    chip,
                    num_chips,
                });
            }
            let pixel: u32 = parse_field(fields[1], line_no)?;
            if pixel >= PIXELS_PER_CHIP {
                return Err(PixelMapError::PixelRange {
                    line: line_no,
                    pixel,
                });
            }

            let nparts = (count - 2) / 2;
            let parts = &mut map.chips[chip as usize][pixel as usize];
            for k in 0..nparts {
                let energy_point: u32 = parse_field(fields[2 + k], line_no)?;
                let weight: f32 = parse_field(fields[2 + nparts + k], line_no)?;
                max_point = max_point.max(energy_point);
                parts.push(EpPart {
                    energy_point,
                    weight,
                });
            }
        }

        map.npoints = max_point + 1;
        Ok(map)
    }

    /// Parse the JSON form. On any error no partial map escapes.
    pub fn from_json_str(text: &str, num_chips: usize) -> Result<Self, PixelMapError> {
        let doc: PixelMapDoc = sonic_rs::from_str(text)?;
        if doc.chips.len() != num_chips {
            return Err(PixelMapError::ChipCount {
                expected: num_chips,
                found: doc.chips.len(),
            });
        }

        let mut map = Self::empty(num_chips);
        let mut max_point = 0u32;
        for (chip, entries) in doc.chips.into_iter().enumerate() {
            for entry in entries {
                if entry.i >= PIXELS_PER_CHIP {
                    return Err(PixelMapError::JsonPixel {
                        chip,
                        pixel: entry.i,
                    });
                }
                if entry.p.len() != entry.f.len() {
                    return Err(PixelMapError::PartLists {
                        chip,
                        pixel: entry.i,
                    });
                }
                let parts = &mut map.chips[chip][entry.i as usize];
                *parts = entry
                    .p
                    .iter()
                    .zip(&entry.f)
                    .map(|(&energy_point, &weight)| {
                        max_point = max_point.max(energy_point);
                        EpPart {
                            energy_point,
                            weight,
                        }
                    })
                    .collect();
            }
        }

        map.npoints = max_point + 1;
        Ok(map)
    }

    /// Emit the JSON form; pixels without contributions are omitted.
    pub fn to_json_string(&self) -> String {
        let doc = PixelMapDoc {
            kind: Some("PixelMap".into()),
            chips: self
                .chips
                .iter()
                .map(|chip| {
                    chip.iter()
                        .enumerate()
                        .filter(|(_, parts)| !parts.is_empty())
                        .map(|(i, parts)| PixelEntry {
                            i: i as u32,
                            p: parts.iter().map(|p| p.energy_point).collect(),
                            f: parts.iter().map(|p| p.weight).collect(),
                        })
                        .collect()
                })
                .collect(),
        };
        sonic_rs::to_string(&doc).unwrap_or_default()
    }

    /// Contributions of one pixel; empty for unmapped pixels.
    #[inline]
    pub fn parts(&self, index: PixelIndex) -> &[EpPart] {
        &self.chips[index.chip as usize][index.flat_pixel as usize]
    }

    /// One past the largest mapped energy point.
    #[inline]
    pub fn npoints(&self) -> u32 {
        self.npoints
    }

    #[inline]
    pub fn num_chips(&self) -> usize {
        self.chips.len()
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, line: usize) -> Result<T, PixelMapError> {
    field.parse().map_err(|_| PixelMapError::Number {
        line,
        field: field.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn text_map(lines: &str) -> Result<PixelMap, PixelMapError> {
        PixelMap::from_text(Cursor::new(lines), 2)
    }

    #[test]
    fn parses_lines_with_multiple_parts() {
        let map = text_map("0,10,1,2,0.25,0.75\n1,65535,4,1.0\n").unwrap();
        assert_eq!(
            map.parts(PixelIndex::from_flat(0, 10)),
            &[
                EpPart {
                    energy_point: 1,
                    weight: 0.25
                },
                EpPart {
                    energy_point: 2,
                    weight: 0.75
                },
            ]
        );
        assert_eq!(map.parts(PixelIndex::from_flat(1, 65535)).len(), 1);
        assert!(map.parts(PixelIndex::from_flat(0, 11)).is_empty());
        assert_eq!(map.npoints(), 5);
    }

    #[test]
    fn rejects_odd_field_count() {
        assert!(matches!(
            text_map("0,10,1,2,0.5\n"),
            Err(PixelMapError::FieldCount { line: 1, count: 5 })
        ));
    }

    #[test]
    fn rejects_single_field_line() {
        assert!(matches!(
            text_map("7\n"),
            Err(PixelMapError::FieldCount { line: 1, count: 1 })
        ));
    }

    #[test]
    fn rejects_out_of_range_indices() {
        assert!(matches!(
            text_map("2,10,1,1.0\n"),
            Err(PixelMapError::ChipRange { chip: 2, .. })
        ));
        assert!(matches!(
            text_map("0,65536,1,1.0\n"),
            Err(PixelMapError::PixelRange { pixel: 65536, .. })
        ));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert!(matches!(
            text_map("0,ten,1,1.0\n"),
            Err(PixelMapError::Number { line: 1, .. })
        ));
        assert!(matches!(
            text_map("0,1,x,1.0\n"),
            Err(PixelMapError::Number { line: 1, .. })
        ));
    }

    #[test]
    fn rejects_overlong_lines() {
        let mut line = String::from("0,1");
        while line.len() <= MAX_LINE_BYTES {
            line.push_str(",1,1");
        }
        assert!(matches!(
            text_map(&line),
            Err(PixelMapError::LineTooLong { line: 1 })
        ));
    }

    #[test]
    fn json_round_trip_is_identical() {
        let map = text_map("0,10,1,2,0.25,0.75\n1,300,0,1.0\n").unwrap();
        let json = map.to_json_string();
        let reloaded = PixelMap::from_json_str(&json, 2).unwrap();
        assert_eq!(map, reloaded);

        let again = PixelMap::from_json_str(&reloaded.to_json_string(), 2).unwrap();
        assert_eq!(reloaded, again);
    }

    #[test]
    fn json_validates_chip_count_and_part_lists() {
        let wrong_chips = r#"{"chips": [[]]}"#;
        assert!(matches!(
            PixelMap::from_json_str(wrong_chips, 2),
            Err(PixelMapError::ChipCount {
                expected: 2,
                found: 1
            })
        ));

        let uneven = r#"{"chips": [[{"i": 0, "p": [1, 2], "f": [0.5]}], []]}"#;
        assert!(matches!(
            PixelMap::from_json_str(uneven, 2),
            Err(PixelMapError::PartLists { chip: 0, pixel: 0 })
        ));

        let bad_pixel = r#"{"chips": [[{"i": 65536, "p": [1], "f": [0.5]}], []]}"#;
        assert!(matches!(
            PixelMap::from_json_str(bad_pixel, 2),
            Err(PixelMapError::JsonPixel {
                chip: 0,
                pixel: 65536
            })
        ));
    }

    #[test]
    fn json_accepts_optional_type_marker() {
        let doc = r#"{"type": "PixelMap", "chips": [[{"i": 5, "p": [3], "f": [1.0]}], []]}"#;
        let map = PixelMap::from_json_str(doc, 2).unwrap();
        assert_eq!(map.npoints(), 4);
        assert_eq!(map.parts(PixelIndex::from_flat(0, 5)).len(), 1);
    }
}
