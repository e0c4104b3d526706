//! Control-plane client for the ASI detector server.
//!
//! Drives the acquisition setup over the server's REST interface: load
//! pixel/DAC configuration, set trigger parameters, point the raw-data
//! destination at our listener and start the measurement. The raw event
//! data itself arrives over a separate TCP connection handled by the
//! engine crate.

pub mod client;

pub use client::{
    ChipPlacement, ControlClient, ControlError, DetectorConfig, DetectorLayoutInfo, TriggerSetup,
};
