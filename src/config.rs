//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! The configuration file is TOML-formatted with the following structure:
//!
//! ```toml
//! [adc]
//! driver = "sim"          # "sim" or "sysfs"
//! channel = 0             # ADC channel (0-7)
//! # device = "/sys/bus/iio/devices/iio:device0"   # sysfs driver only
//!
//! [acquisition]
//! threshold_mv = 1650     # initial threshold (0-3300 mV)
//! batch_size = 100        # samples per data packet (1-500)
//!
//! [network]
//! port = 5000             # UDP listen port
//! # interface = "eth0"    # carrier-file link detection (optional)
//! ```
//!
//! All sections and fields are optional; missing values fall back to the
//! defaults above. Validation happens at load time so the daemon fails fast
//! on an out-of-range threshold, batch size, or channel.

use crate::error::{Error, Result};
use crate::state::{ADC_CHANNEL_COUNT, ADC_VREF_MV, MAX_BATCH_SIZE};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// ADC backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdcConfig {
    /// ADC driver type
    ///
    /// **Valid values**: "sim" (simulated waveform), "sysfs" (Linux IIO)
    #[serde(default = "default_adc_driver")]
    pub driver: String,

    /// ADC channel to sample at startup
    ///
    /// **Valid range**: 0-7
    #[serde(default)]
    pub channel: u8,

    /// IIO device directory for the "sysfs" driver
    ///
    /// **Format**: directory containing `in_voltage<N>_raw` attribute files
    /// **Required**: for the "sysfs" driver only
    #[serde(default)]
    pub device: Option<String>,
}

fn default_adc_driver() -> String {
    "sim".to_string()
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            driver: default_adc_driver(),
            channel: 0,
            device: None,
        }
    }
}

/// Initial acquisition parameters
///
/// These are startup values only; both can be changed at runtime through
/// CONFIGURE commands on the control socket.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    /// Sample threshold in millivolts
    ///
    /// **Valid range**: 0-3300 (the ADC reference voltage)
    /// Samples below the threshold are discarded.
    #[serde(default = "default_threshold_mv")]
    pub threshold_mv: u16,

    /// Number of qualifying samples per data packet
    ///
    /// **Valid range**: 1-500
    #[serde(default = "default_batch_size")]
    pub batch_size: u16,
}

fn default_threshold_mv() -> u16 {
    1650
}

fn default_batch_size() -> u16 {
    100
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            threshold_mv: default_threshold_mv(),
            batch_size: default_batch_size(),
        }
    }
}

/// Network configuration for the UDP control/data socket
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// UDP port to listen on for control traffic
    #[serde(default = "default_port")]
    pub port: u16,

    /// Network interface whose carrier state gates the data path
    ///
    /// When set, link state is read from `/sys/class/net/<interface>/carrier`.
    /// When unset, link state falls back to the "local address assigned"
    /// heuristic.
    #[serde(default)]
    pub interface: Option<String>,
}

fn default_port() -> u16 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            interface: None,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub adc: AdcConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Validation
    ///
    /// - `adc.driver` must be a known driver type
    /// - the "sysfs" driver requires `adc.device`
    /// - `adc.channel` must be 0-7
    /// - `acquisition.threshold_mv` must be 0-3300
    /// - `acquisition.batch_size` must be 1-500
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to built-in defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            log::warn!(
                "Config file {} not found, using defaults (sim ADC)",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        match self.adc.driver.as_str() {
            "sim" => {}
            "sysfs" => {
                if self.adc.device.is_none() {
                    return Err(Error::Config(
                        "sysfs ADC driver requires adc.device".to_string(),
                    ));
                }
            }
            other => {
                return Err(Error::Config(format!("Unknown ADC driver: {}", other)));
            }
        }

        if self.adc.channel >= ADC_CHANNEL_COUNT {
            return Err(Error::Config(format!(
                "adc.channel must be 0-{} (got {})",
                ADC_CHANNEL_COUNT - 1,
                self.adc.channel
            )));
        }

        if self.acquisition.threshold_mv > ADC_VREF_MV {
            return Err(Error::Config(format!(
                "acquisition.threshold_mv must be 0-{} (got {})",
                ADC_VREF_MV, self.acquisition.threshold_mv
            )));
        }

        let batch = self.acquisition.batch_size;
        if batch == 0 || batch > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "acquisition.batch_size must be 1-{} (got {})",
                MAX_BATCH_SIZE, batch
            )));
        }

        Ok(())
    }
}
