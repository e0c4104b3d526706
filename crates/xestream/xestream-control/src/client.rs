use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {url}")]
    Response {
        url: String,
        #[source]
        source: sonic_rs::Error,
    },
}

/// Trigger setup written into the detector configuration before a run.
#[derive(Debug, Clone, Copy)]
pub struct TriggerSetup {
    pub num_triggers: u32,
    pub shutter_open_ms: u32,
    pub shutter_closed_ms: u32,
}

impl Default for TriggerSetup {
    fn default() -> Self {
        Self {
            num_triggers: 1,
            shutter_open_ms: 490,
            shutter_closed_ms: 10,
        }
    }
}

/// Detector configuration as served by `/detector/config`. Only the keys we
/// rewrite are typed; everything else passes through untouched.
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(rename = "nTriggers", default)]
    pub n_triggers: u32,
    #[serde(rename = "TriggerMode", default)]
    pub trigger_mode: String,
    #[serde(rename = "TriggerPeriod", default)]
    pub trigger_period: f32,
    #[serde(rename = "ExposureTime", default)]
    pub exposure_time: f32,
    #[serde(flatten)]
    rest: BTreeMap<String, sonic_rs::Value>,
}

#[derive(Debug, Deserialize)]
struct Dashboard {
    #[serde(rename = "Server")]
    server: DashboardServer,
}

#[derive(Debug, Deserialize)]
struct DashboardServer {
    #[serde(rename = "SoftwareVersion", default)]
    software_version: String,
}

#[derive(Debug, Deserialize)]
struct DetectorInfo {
    #[serde(rename = "NumberOfChips")]
    number_of_chips: usize,
}

/// Chip placement as served by `/detector/layout`, in pixels.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorLayoutInfo {
    #[serde(rename = "Width")]
    pub width: u32,
    #[serde(rename = "Height")]
    pub height: u32,
    #[serde(rename = "Chips", default)]
    pub chips: Vec<ChipPlacement>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChipPlacement {
    #[serde(rename = "X")]
    pub x: u32,
    #[serde(rename = "Y")]
    pub y: u32,
}

/// Blocking client for the ASI server REST interface.
pub struct ControlClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl ControlClient {
    /// `server` is a `host:port` address.
    pub fn connect(server: &str) -> Result<Self, ControlError> {
        let base = format!("http://{server}");
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| ControlError::Http {
                url: base.clone(),
                source,
            })?;
        Ok(Self { base, http })
    }

    /// Server software version from `/dashboard`.
    pub fn software_version(&self) -> Result<String, ControlError> {
        let dashboard: Dashboard = self.get_json("/dashboard")?;
        Ok(dashboard.server.software_version)
    }

    /// Load the binary pixel configuration and DACs files; both paths are
    /// as seen by the server.
    pub fn load_detector_files(&self, bpc_file: &str, dacs_file: &str) -> Result<(), ControlError> {
        let response =
            self.get_text(&format!("/config/load?format=pixelconfig&file={bpc_file}"))?;
        info!(%response, "loaded binary pixel configuration");
        let response = self.get_text(&format!("/config/load?format=dacs&file={dacs_file}"))?;
        info!(%response, "loaded dacs");
        Ok(())
    }

    pub fn detector_config(&self) -> Result<DetectorConfig, ControlError> {
        self.get_json("/detector/config")
    }

    /// Fetch the detector configuration, apply the trigger setup and write
    /// it back. Trigger period and exposure are in seconds on the wire.
    pub fn configure_triggers(&self, setup: TriggerSetup) -> Result<(), ControlError> {
        let mut config = self.detector_config()?;
        config.n_triggers = setup.num_triggers;
        config.trigger_mode = "AUTOTRIGSTART_TIMERSTOP".into();
        config.trigger_period = (setup.shutter_open_ms + setup.shutter_closed_ms) as f32 / 1000.0;
        config.exposure_time = setup.shutter_open_ms as f32 / 1000.0;
        let response = self.put_json("/detector/config", &config)?;
        info!(%response, "detector configuration updated");
        Ok(())
    }

    /// `NumberOfChips` from `/detector/info`.
    pub fn number_of_chips(&self) -> Result<usize, ControlError> {
        let info: DetectorInfo = self.get_json("/detector/info")?;
        Ok(info.number_of_chips)
    }

    /// Chip placement from `/detector/layout`.
    pub fn detector_layout(&self) -> Result<DetectorLayoutInfo, ControlError> {
        self.get_json("/detector/layout")
    }

    /// Point the server's raw data output at `address` (our listener).
    pub fn set_raw_destination(&self, address: &str) -> Result<(), ControlError> {
        let body = format!(r#"{{ "Raw": [{{ "Base": "tcp://connect@{address}" }}] }}"#);
        let url = self.url("/server/destination");
        let response = self
            .http
            .put(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .map_err(|source| ControlError::Http {
                url: url.clone(),
                source,
            })?;
        let response = Self::check(url, response)?;
        info!(%response, "raw destination configured");
        Ok(())
    }

    pub fn start_measurement(&self) -> Result<(), ControlError> {
        let response = self.get_text("/measurement/start")?;
        info!(%response, "measurement started");
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn get_text(&self, path: &str) -> Result<String, ControlError> {
        let url = self.url(path);
        debug!(%url, "GET");
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|source| ControlError::Http {
                url: url.clone(),
                source,
            })?;
        Self::check(url, response)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ControlError> {
        let url = self.url(path);
        let body = self.get_text(path)?;
        sonic_rs::from_str(&body).map_err(|source| ControlError::Response { url, source })
    }

    fn put_json<T: Serialize>(&self, path: &str, value: &T) -> Result<String, ControlError> {
        let url = self.url(path);
        let body = sonic_rs::to_string(value).map_err(|source| ControlError::Response {
            url: url.clone(),
            source,
        })?;
        debug!(%url, "PUT");
        let response = self
            .http
            .put(&url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .map_err(|source| ControlError::Http {
                url: url.clone(),
                source,
            })?;
        Self::check(url, response)
    }

    fn check(url: String, response: reqwest::blocking::Response) -> Result<String, ControlError> {
        let status = response.status();
        let body = response.text().map_err(|source| ControlError::Http {
            url: url.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(ControlError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_config_preserves_unknown_keys() {
        let text = r#"{"nTriggers": 5, "TriggerMode": "MANUAL", "BiasVoltage": 100, "BiasEnabled": true}"#;
        let mut config: DetectorConfig = sonic_rs::from_str(text).unwrap();
        assert_eq!(config.n_triggers, 5);

        config.trigger_mode = "AUTOTRIGSTART_TIMERSTOP".into();
        config.trigger_period = 0.5;
        let out = sonic_rs::to_string(&config).unwrap();
        assert!(out.contains("\"BiasVoltage\":100"), "{out}");
        assert!(out.contains("AUTOTRIGSTART_TIMERSTOP"), "{out}");
    }

    #[test]
    fn layout_parses_chip_placements() {
        let layout: DetectorLayoutInfo = sonic_rs::from_str(
            r#"{"Width": 512, "Height": 512, "Chips": [{"X": 0, "Y": 0}, {"X": 256, "Y": 0}, {"X": 0, "Y": 256}, {"X": 256, "Y": 256}]}"#,
        )
        .unwrap();
        assert_eq!((layout.width, layout.height), (512, 512));
        assert_eq!(layout.chips.len(), 4);
        assert_eq!((layout.chips[3].x, layout.chips[3].y), (256, 256));
    }

    #[test]
    fn dashboard_and_info_parse() {
        let dashboard: Dashboard =
            sonic_rs::from_str(r#"{"Server": {"SoftwareVersion": "3.3.2"}, "Measurement": null}"#)
                .unwrap();
        assert_eq!(dashboard.server.software_version, "3.3.2");

        let info: DetectorInfo =
            sonic_rs::from_str(r#"{"NumberOfChips": 4, "IfaceName": "eth0"}"#).unwrap();
        assert_eq!(info.number_of_chips, 4);
    }

    #[test]
    fn trigger_setup_defaults_match_acquisition_init() {
        let setup = TriggerSetup::default();
        assert_eq!(setup.num_triggers, 1);
        assert_eq!(setup.shutter_open_ms + setup.shutter_closed_ms, 500);
    }
}
