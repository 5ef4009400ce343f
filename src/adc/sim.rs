//! Simulated ADC
//!
//! Default mode synthesizes a slow sine sweep with Gaussian noise across the
//! 12-bit range, so a node running without hardware produces a plausible
//! mixture of samples above and below any threshold. The scripted mode
//! replays a fixed sequence and then reports `Busy`, which is what the
//! acquisition tests use to drive exact scenarios.

use super::{check_channel, AdcDriver};
use crate::error::{Error, Result};
use crate::state::ADC_MAX_VALUE;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::VecDeque;

/// Noise standard deviation in ADC counts
const NOISE_SIGMA: f32 = 40.0;
/// Sine sweep period in samples
const SWEEP_PERIOD: u32 = 2048;

enum Mode {
    Waveform {
        rng: SmallRng,
        noise: Normal<f32>,
        phase: u32,
    },
    Scripted(VecDeque<u16>),
}

pub struct SimAdc {
    mode: Mode,
    channel: u8,
    initialized: bool,
    last_value: u16,
    done: bool,
}

impl SimAdc {
    pub fn new() -> Self {
        Self {
            mode: Mode::Waveform {
                rng: SmallRng::from_entropy(),
                noise: Normal::new(0.0, NOISE_SIGMA).expect("valid normal distribution"),
                phase: 0,
            },
            channel: 0,
            initialized: false,
            last_value: 0,
            done: false,
        }
    }

    /// Replay `samples` in order, then report `Busy`
    pub fn scripted(samples: &[u16]) -> Self {
        Self {
            mode: Mode::Scripted(samples.iter().copied().collect()),
            channel: 0,
            initialized: true,
            last_value: 0,
            done: false,
        }
    }

    fn next_sample(&mut self) -> Result<u16> {
        match &mut self.mode {
            Mode::Waveform { rng, noise, phase } => {
                *phase = (*phase + 1) % SWEEP_PERIOD;
                let angle = *phase as f32 / SWEEP_PERIOD as f32 * std::f32::consts::TAU;
                let mid = ADC_MAX_VALUE as f32 / 2.0;
                let value = mid + mid * 0.8 * angle.sin() + noise.sample(rng);
                Ok(value.clamp(0.0, ADC_MAX_VALUE as f32) as u16)
            }
            Mode::Scripted(queue) => queue.pop_front().ok_or(Error::Busy),
        }
    }
}

impl Default for SimAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl AdcDriver for SimAdc {
    fn init(&mut self, channel: u8) -> Result<()> {
        check_channel(channel)?;
        self.channel = channel;
        self.initialized = true;
        self.done = false;
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
        self.last_value = self.next_sample()?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waveform_in_range() {
        let mut adc = SimAdc::new();
        adc.init(0).unwrap();

        for _ in 0..1000 {
            let value = adc.read_sync().unwrap();
            assert!(value <= ADC_MAX_VALUE);
        }
    }

    #[test]
    fn test_scripted_sequence() {
        let mut adc = SimAdc::scripted(&[100, 2500, 3000]);
        assert_eq!(adc.read_sync().unwrap(), 100);
        assert_eq!(adc.read_sync().unwrap(), 2500);
        assert_eq!(adc.read_sync().unwrap(), 3000);
        assert!(matches!(adc.read_sync(), Err(Error::Busy)));
    }

    #[test]
    fn test_value_busy_before_conversion() {
        let mut adc = SimAdc::new();
        adc.init(0).unwrap();
        assert!(!adc.conversion_done());
        assert!(matches!(adc.value(), Err(Error::Busy)));

        adc.start_conversion().unwrap();
        assert!(adc.conversion_done());
        assert!(adc.value().is_ok());
    }

    #[test]
    fn test_uninitialized_rejected() {
        let mut adc = SimAdc::new();
        assert!(adc.start_conversion().is_err());

        adc.init(0).unwrap();
        adc.deinit().unwrap();
        assert!(adc.start_conversion().is_err());
    }

    #[test]
    fn test_invalid_channel() {
        let mut adc = SimAdc::new();
        assert!(matches!(adc.init(8), Err(Error::InvalidArgument(_))));
    }
}
