//! Linux IIO sysfs ADC driver
//!
//! Reads raw conversions from `in_voltage<N>_raw` attribute files under an
//! IIO device directory (e.g. `/sys/bus/iio/devices/iio:device0`). The
//! kernel performs the conversion synchronously on read, so "start" reads
//! the attribute and latches the result behind the done flag.

use super::{check_channel, AdcDriver};
use crate::error::{Error, Result};
use crate::state::ADC_MAX_VALUE;
use std::fs;
use std::path::PathBuf;

pub struct SysfsAdc {
    device_dir: PathBuf,
    channel: u8,
    initialized: bool,
    last_value: u16,
    done: bool,
}

impl SysfsAdc {
    pub fn new(device_dir: &str) -> Self {
        Self {
            device_dir: PathBuf::from(device_dir),
            channel: 0,
            initialized: false,
            last_value: 0,
            done: false,
        }
    }

    fn attr_path(&self) -> PathBuf {
        self.device_dir
            .join(format!("in_voltage{}_raw", self.channel))
    }
}

impl AdcDriver for SysfsAdc {
    fn init(&mut self, channel: u8) -> Result<()> {
        check_channel(channel)?;

        if self.initialized && self.channel == channel {
            return Ok(());
        }

        self.channel = channel;
        let path = self.attr_path();
        if !path.exists() {
            return Err(Error::Config(format!(
                "ADC attribute {} not present",
                path.display()
            )));
        }

        self.initialized = true;
        self.done = false;
        log::info!("Sysfs ADC initialized on channel {}", channel);
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.initialized = false;
        self.done = false;
        Ok(())
    }

    fn start_conversion(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::InvalidArgument("ADC not initialized".into()));
        }

        self.done = false;
        let raw = fs::read_to_string(self.attr_path())?;
        let value: u32 = raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("bad ADC reading '{}': {}", raw.trim(), e)))?;

        self.last_value = value.min(ADC_MAX_VALUE as u32) as u16;
        self.done = true;
        Ok(())
    }

    fn conversion_done(&self) -> bool {
        self.done
    }

    fn value(&self) -> Result<u16> {
        if !self.initialized {
            return Err(Error::InvalidArgument("ADC not initialized".into()));
        }
        if !self.done {
            return Err(Error::Busy);
        }
        Ok(self.last_value)
    }
}
