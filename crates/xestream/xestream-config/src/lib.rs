pub mod config;

pub use config::{AppConfig, ConfigError, PixelMapFormat};
