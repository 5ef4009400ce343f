//! ADC drivers
//!
//! Single-channel, completion-flag design: a conversion is started
//! asynchronously, a done flag is observed, and the 12-bit result is read
//! out. At most one conversion is in flight per driver. Drivers are not
//! internally synchronized; the owner serializes access (the daemon keeps
//! the driver behind a mutex shared by the acquisition loop and the channel
//! reconfiguration path).

mod sim;
mod sysfs;

pub use sim::SimAdc;
pub use sysfs::SysfsAdc;

use crate::config::AdcConfig;
use crate::error::{Error, Result};
use crate::state::ADC_CHANNEL_COUNT;

/// Hardware abstraction for a single-channel ADC
pub trait AdcDriver: Send {
    /// Configure the driver for `channel`; idempotent
    fn init(&mut self, channel: u8) -> Result<()>;

    /// Undo `init`
    fn deinit(&mut self) -> Result<()>;

    /// Arm a conversion and clear the done flag
    fn start_conversion(&mut self) -> Result<()>;

    /// Whether the last started conversion has completed
    fn conversion_done(&self) -> bool;

    /// Last converted 12-bit value, or `Busy` if no conversion has completed
    fn value(&self) -> Result<u16>;

    /// Start a conversion and busy-wait for the result
    fn read_sync(&mut self) -> Result<u16> {
        self.start_conversion()?;
        while !self.conversion_done() {
            std::hint::spin_loop();
        }
        self.value()
    }
}

pub(crate) fn check_channel(channel: u8) -> Result<()> {
    if channel >= ADC_CHANNEL_COUNT {
        return Err(Error::InvalidArgument(format!(
            "ADC channel {} out of range (0-{})",
            channel,
            ADC_CHANNEL_COUNT - 1
        )));
    }
    Ok(())
}

/// Create the ADC driver selected by the configuration
pub fn create_adc(config: &AdcConfig) -> Result<Box<dyn AdcDriver>> {
    match config.driver.as_str() {
        "sim" => Ok(Box::new(SimAdc::new())),
        "sysfs" => {
            let device = config.device.as_deref().ok_or_else(|| {
                Error::Config("sysfs ADC driver requires adc.device".to_string())
            })?;
            Ok(Box::new(SysfsAdc::new(device)))
        }
        other => Err(Error::Config(format!("Unknown ADC driver: {}", other))),
    }
}
