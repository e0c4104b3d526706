//! Destination writers for completed per-period spectra.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::TcpStream;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use tpx3_core::Period;
use tpx3_detector::Detector;

use crate::data::SpectraData;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to write spectra to '{dest}'")]
    Io {
        dest: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode spectra for '{dest}'")]
    Encode {
        dest: String,
        #[source]
        source: sonic_rs::Error,
    },

    #[error("{0} - unsupported destination uri scheme")]
    UnknownScheme(String),
}

/// Emitter of completed per-period spectra.
pub trait SpectraWriter: Send {
    fn write(&mut self, data: &SpectraData, period: Period) -> Result<(), WriterError>;

    /// Human-readable destination for logs.
    fn dest(&self) -> String;
}

/// Create a writer from a destination URI: `file:<base>` writes
/// `<base>-<period>.xes` text files, `tcp:<host>:<port>` streams one JSON
/// object per period.
pub fn writer_from_uri(uri: &str, det: &Detector) -> Result<Box<dyn SpectraWriter>, WriterError> {
    match uri.split_once(':') {
        Some(("file", base)) => Ok(Box::new(FileWriter {
            base: base.to_string(),
            npoints: det.energy_points.npoints() as usize,
            troi_n: det.troi_n as usize,
        })),
        Some(("tcp", address)) => {
            let stream = TcpStream::connect(address).map_err(|source| WriterError::Io {
                dest: address.to_string(),
                source,
            })?;
            Ok(Box::new(TcpWriter {
                dest: address.to_string(),
                stream,
            }))
        }
        _ => Err(WriterError::UnknownScheme(uri.to_string())),
    }
}

/// Writes `<base>-<period>.xes`: `npoints` rows of `troi_n` counts.
struct FileWriter {
    base: String,
    npoints: usize,
    troi_n: usize,
}

impl SpectraWriter for FileWriter {
    fn write(&mut self, data: &SpectraData, period: Period) -> Result<(), WriterError> {
        let path = format!("{}-{}.xes", self.base, period);
        let io_err = |source| WriterError::Io {
            dest: path.clone(),
            source,
        };

        let mut out = BufWriter::new(File::create(&path).map_err(io_err)?);
        let values = data.values();
        for ep in 0..self.npoints {
            for tp in 0..self.troi_n {
                write!(out, "{} ", values[tp * self.npoints + ep]).map_err(io_err)?;
            }
            writeln!(out).map_err(io_err)?;
        }
        out.flush().map_err(io_err)?;
        debug!(%path, period, "spectra file written");
        Ok(())
    }

    fn dest(&self) -> String {
        format!("file:{}", self.base)
    }
}

#[derive(Serialize)]
struct PeriodMessage<'a> {
    #[serde(rename = "Period")]
    period: Period,
    #[serde(rename = "TDSpectra")]
    td_spectra: &'a [f32],
}

/// Streams `{"Period":<p>,"TDSpectra":[...]}` per period, flushed.
struct TcpWriter {
    dest: String,
    stream: TcpStream,
}

impl SpectraWriter for TcpWriter {
    fn write(&mut self, data: &SpectraData, period: Period) -> Result<(), WriterError> {
        let message = PeriodMessage {
            period,
            td_spectra: data.values(),
        };
        let encoded = sonic_rs::to_string(&message).map_err(|source| WriterError::Encode {
            dest: self.dest.clone(),
            source,
        })?;
        let io_err = |source| WriterError::Io {
            dest: self.dest.clone(),
            source,
        };
        self.stream.write_all(encoded.as_bytes()).map_err(io_err)?;
        self.stream.flush().map_err(io_err)?;
        debug!(dest = %self.dest, period, "spectra sent");
        Ok(())
    }

    fn dest(&self) -> String {
        format!("tcp:{}", self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use std::net::TcpListener;
    use tpx3_detector::{DetectorLayout, PixelIndex, PixelMap};

    fn detector() -> Detector {
        let mut det = Detector::new(DetectorLayout::row(1));
        det.set_time_roi(0, 1, 4);
        det.energy_points = PixelMap::from_text(Cursor::new("0,0,0,1,1.0,2.0\n"), 1).unwrap();
        det
    }

    fn sample_data(det: &Detector) -> SpectraData {
        let mut data = SpectraData::new(det);
        data.record(det, PixelIndex::from_flat(0, 0), 2, 10);
        data
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let det = detector();
        assert!(matches!(
            writer_from_uri("udp:localhost:1234", &det),
            Err(WriterError::UnknownScheme(_))
        ));
        assert!(matches!(
            writer_from_uri("plainpath", &det),
            Err(WriterError::UnknownScheme(_))
        ));
    }

    #[test]
    fn file_writer_lays_out_points_by_row() {
        let det = detector();
        let dir = std::env::temp_dir().join(format!("tpx3_spectra_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let base = dir.join("run7").to_string_lossy().into_owned();

        let mut writer = writer_from_uri(&format!("file:{base}"), &det).unwrap();
        writer.write(&sample_data(&det), 42).unwrap();

        let text = std::fs::read_to_string(format!("{base}-42.xes")).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        // npoints rows x troi_n columns; the event sits in time bin 2
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].split_whitespace().collect::<Vec<_>>(), [
            "0", "0", "1", "0"
        ]);
        assert_eq!(rows[1].split_whitespace().collect::<Vec<_>>(), [
            "0", "0", "2", "0"
        ]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn tcp_writer_sends_one_json_object_per_period() {
        let det = detector();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let receiver = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut text = String::new();
            conn.read_to_string(&mut text).unwrap();
            text
        });

        {
            let mut writer = writer_from_uri(&format!("tcp:{addr}"), &det).unwrap();
            writer.write(&sample_data(&det), 3).unwrap();
        } // drop closes the connection

        let text = receiver.join().unwrap();
        assert!(text.starts_with(r#"{"Period":3,"TDSpectra":["#), "{text}");
        let values: Vec<f32> = text
            .trim_start_matches(r#"{"Period":3,"TDSpectra":["#)
            .trim_end_matches("]}")
            .split(',')
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(values.len(), 8);
        assert_eq!(values.iter().sum::<f32>(), 3.0);
    }
}
