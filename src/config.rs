use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::controller::ControllerSettings;
use crate::zebra::{CaptureMask, CaptureSource, Encoder};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlyScanConfig {
    pub gateway: GatewayConfig,
    pub zebra: ZebraConfig,
    pub motor: MotorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ZebraConfig {
    /// Record-name prefix of the position-compare unit
    pub pv_prefix: String,
    /// Absolute tolerance for timing-register readbacks
    pub readback_tolerance: f64,
    /// Encoder input the gate compares against (1-4)
    pub encoder: u8,
    /// Capture-channel indices latched on each pulse
    pub capture_channels: Vec<u8>,
    pub register_poll_interval_ms: u64,
    pub disarm_retry_every: u32,
    pub disarm_poll_limit: u32,
    pub arm_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MotorConfig {
    /// Motor record driving the scan axis
    pub record: String,
    /// Floor on the run-up distance, axis units
    pub min_accel_distance: f64,
    pub move_poll_interval_ms: u64,
    pub drain_poll_limit: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    /// JSONL per-line scan log; disabled when empty
    pub scan_log_path: String,
    pub scan_log_buffer: usize,
}

impl Default for FlyScanConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            zebra: ZebraConfig::default(),
            motor: MotorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5064,
            connect_timeout_ms: 5000,
            read_timeout_ms: 10000,
            write_timeout_ms: 5000,
        }
    }
}

impl Default for ZebraConfig {
    fn default() -> Self {
        Self {
            pv_prefix: "BL00T-EA-ZEBRA-01".to_string(),
            readback_tolerance: 1e-4,
            encoder: 1,
            capture_channels: vec![0],
            register_poll_interval_ms: 50,
            disarm_retry_every: 10,
            disarm_poll_limit: 100,
            arm_timeout_ms: 5000,
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            record: "BL00T-MO-STAGE-01:X".to_string(),
            min_accel_distance: 0.0,
            move_poll_interval_ms: 25,
            drain_poll_limit: 200,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            scan_log_path: String::new(),
            scan_log_buffer: 16,
        }
    }
}

impl ZebraConfig {
    pub fn encoder_select(&self) -> Encoder {
        match self.encoder {
            2 => Encoder::Enc2,
            3 => Encoder::Enc3,
            4 => Encoder::Enc4,
            _ => Encoder::Enc1,
        }
    }

    pub fn capture_mask(&self) -> CaptureMask {
        self.capture_channels
            .iter()
            .filter_map(|&index| CaptureSource::from_index(index as usize))
            .fold(CaptureMask::empty(), CaptureMask::with)
    }
}

impl FlyScanConfig {
    /// Orchestrator settings assembled from the deployment values.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            encoder: self.zebra.encoder_select(),
            capture: self.zebra.capture_mask(),
            min_accel_distance: self.motor.min_accel_distance,
            register_poll_interval: Duration::from_millis(self.zebra.register_poll_interval_ms),
            disarm_retry_every: self.zebra.disarm_retry_every,
            disarm_poll_limit: self.zebra.disarm_poll_limit,
            arm_timeout: Duration::from_millis(self.zebra.arm_timeout_ms),
            move_poll_interval: Duration::from_millis(self.motor.move_poll_interval_ms),
            drain_poll_limit: self.motor.drain_poll_limit,
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<FlyScanConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&FlyScanConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else if Path::new("flyscan.toml").exists() {
        builder = builder.add_source(File::with_name("flyscan.toml"));
    }

    // Add environment variable overrides with prefix "ZEBRA_FLYSCAN_"
    builder = builder.add_source(
        Environment::with_prefix("ZEBRA_FLYSCAN")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<FlyScanConfig>()
}

/// Load configuration with better error handling and defaults
pub fn load_config_or_default(config_path: Option<&Path>) -> FlyScanConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            FlyScanConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_builder() {
        let config = load_config(None).unwrap();
        assert_eq!(config.zebra.readback_tolerance, 1e-4);
        assert_eq!(config.gateway.port, 5064);
    }

    #[test]
    fn test_capture_mask_from_indices() {
        let zebra = ZebraConfig {
            capture_channels: vec![0, 4, 9],
            ..ZebraConfig::default()
        };
        let mask = zebra.capture_mask();
        assert!(mask.contains(CaptureSource::Enc1));
        assert!(mask.contains(CaptureSource::Time));
        assert_eq!(mask.bits(), 0b1_0001);
    }

    #[test]
    fn test_controller_settings_assembly() {
        let settings = FlyScanConfig::default().controller_settings();
        assert_eq!(settings.encoder, Encoder::Enc1);
        assert_eq!(settings.register_poll_interval, Duration::from_millis(50));
        assert_eq!(settings.drain_poll_limit, 200);
    }
}
