use serde::Deserialize;
use std::path::Path;

/// Processing configuration.
///
/// The time-ROI and output keys keep their historical INI names; the rest
/// configures the acquisition pipeline. Every key has a default, so an
/// empty file is a valid configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Address the ASI detector server listens on.
    #[serde(default = "defaults::server")]
    pub server: String,

    /// Address we accept the raw data stream on.
    #[serde(default = "defaults::listen")]
    pub listen: String,

    /// Chip count used when the control plane is skipped.
    #[serde(default = "defaults::num_chips")]
    pub num_chips: usize,

    /// IO buffer byte size; rounded up to a multiple of 8, minimum 8.
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// IO buffers preallocated per chip pool.
    #[serde(default = "defaults::num_buffers")]
    pub num_buffers: usize,

    /// Assumed TDC interval in clock ticks until the predictor locks on.
    #[serde(default = "defaults::initial_period")]
    pub initial_period: i64,

    /// Dispute band width as a fraction of the interval, in (0, 0.5).
    #[serde(default = "defaults::threshold")]
    pub threshold: f64,

    /// Recent period boundaries retained per chip.
    #[serde(default = "defaults::max_period_queues")]
    pub max_period_queues: usize,

    /// Aggregator slot count; 0 derives `2 * max_period_queues + chips`.
    #[serde(default)]
    pub num_slots: usize,

    /// Pixel to energy-point map file.
    #[serde(default = "defaults::pixel_map")]
    pub pixel_map: String,

    #[serde(default)]
    pub pixel_map_format: PixelMapFormat,

    /// Spectra destination: `file:<base>` or `tcp:<host>:<port>`. Empty
    /// derives `file:<FileOutputPath><ShortFileName>`.
    #[serde(default)]
    pub destination: String,

    /// Bin by TOT instead of relative TOA when false.
    #[serde(default = "defaults::toa_mode")]
    pub toa_mode: bool,

    #[serde(rename = "TRStart", default)]
    pub tr_start: u64,

    #[serde(rename = "TRStep", default = "defaults::tr_step")]
    pub tr_step: u64,

    #[serde(rename = "TRN", default = "defaults::tr_n")]
    pub tr_n: u64,

    #[serde(rename = "FileOutputPath", default)]
    pub file_output_path: String,

    #[serde(rename = "ShortFileName", default = "defaults::short_file_name")]
    pub short_file_name: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelMapFormat {
    /// Decide by file extension: `.json` selects JSON, anything else text.
    #[default]
    Auto,
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn server() -> String {
        "localhost:8080".into()
    }

    pub fn listen() -> String {
        "127.0.0.1:8451".into()
    }

    pub fn num_chips() -> usize {
        4
    }

    pub fn buffer_size() -> usize {
        1024
    }

    pub fn num_buffers() -> usize {
        8
    }

    pub fn initial_period() -> i64 {
        // ~4.9 kHz trigger at 640 MHz ticks
        131_072
    }

    pub fn threshold() -> f64 {
        0.1
    }

    pub fn max_period_queues() -> usize {
        2
    }

    pub fn pixel_map() -> String {
        "XESPoints.inp".into()
    }

    pub fn toa_mode() -> bool {
        true
    }

    pub fn tr_step() -> u64 {
        1
    }

    pub fn tr_n() -> u64 {
        5000
    }

    pub fn short_file_name() -> String {
        "spectra".into()
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Destination URI, derived from the output path keys when not set.
    pub fn destination_uri(&self) -> String {
        if self.destination.is_empty() {
            format!("file:{}{}", self.file_output_path, self.short_file_name)
        } else {
            self.destination.clone()
        }
    }

    /// Buffer size rounded up to whole 64-bit words.
    pub fn effective_buffer_size(&self) -> usize {
        (self.buffer_size.max(8) + 7) & !7
    }

    /// Slot count, derived when `num_slots` is 0.
    pub fn effective_num_slots(&self) -> usize {
        if self.num_slots == 0 {
            2 * self.max_period_queues + self.num_chips
        } else {
            self.num_slots
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold > 0.0 && self.threshold < 0.5) {
            return Err(ConfigError::Invalid(format!(
                "threshold {} outside (0, 0.5)",
                self.threshold
            )));
        }
        if self.initial_period <= 0 {
            return Err(ConfigError::Invalid(format!(
                "initial_period {} not positive",
                self.initial_period
            )));
        }
        if self.num_chips == 0 {
            return Err(ConfigError::Invalid("num_chips is zero".into()));
        }
        Ok(())
    }
}
