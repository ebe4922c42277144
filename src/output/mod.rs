//! Output drivers for the light.
//!
//! A driver maps the logical `0..=100` level linearly onto the native range of the
//! hardware and writes it. Drivers never report failure upward and never queue:
//! the latest level wins.

use crate::config::{OutputConfig, OutputKind};
use crate::level::LightLevel;
use rppal::pwm::{Channel, Polarity, Pwm};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("PWM error: {0}")]
    Pwm(#[from] rppal::pwm::Error),

    #[error("PWM channel {0} does not exist")]
    UnknownChannel(u8),
}

pub trait OutputDriver {
    fn apply(&mut self, level: LightLevel);
}

impl<T: OutputDriver + ?Sized> OutputDriver for Box<T> {
    fn apply(&mut self, level: LightLevel) {
        (**self).apply(level)
    }
}

/// Linear map from `0..=100` onto `0..=range`.
pub fn drive_value(level: LightLevel, range: u32) -> u32 {
    (u64::from(level.get()) * u64::from(range) / 100) as u32
}

/// Hardware PWM output through the SoC's PWM peripheral.
pub struct PwmOutput {
    pwm: Pwm,
    range: u32,
}

impl PwmOutput {
    pub fn open(config: &OutputConfig) -> Result<Self, OutputError> {
        let channel = match config.channel {
            0 => Channel::Pwm0,
            1 => Channel::Pwm1,
            other => return Err(OutputError::UnknownChannel(other)),
        };

        let pwm = Pwm::with_frequency(channel, config.frequency_hz, 0.0, Polarity::Normal, true)?;
        info!(
            "PWM output ready on channel {} at {} Hz",
            config.channel, config.frequency_hz
        );

        Ok(Self {
            pwm,
            range: config.range,
        })
    }
}

impl OutputDriver for PwmOutput {
    fn apply(&mut self, level: LightLevel) {
        let drive = drive_value(level, self.range);
        let duty = f64::from(drive) / f64::from(self.range);
        if let Err(e) = self.pwm.set_duty_cycle(duty) {
            warn!("Failed to set PWM duty cycle to {:.3}: {}", duty, e);
        }
    }
}

/// Output for hosts without a PWM peripheral: records the drive value in the log.
#[derive(Debug, Clone)]
pub struct LogOutput {
    range: u32,
    last: Option<u32>,
}

impl LogOutput {
    pub fn new(range: u32) -> Self {
        Self { range, last: None }
    }

    pub fn last_drive(&self) -> Option<u32> {
        self.last
    }
}

impl OutputDriver for LogOutput {
    fn apply(&mut self, level: LightLevel) {
        let drive = drive_value(level, self.range);
        debug!("Output drive {} / {}", drive, self.range);
        self.last = Some(drive);
    }
}

/// Builds the configured driver. A PWM driver that cannot be opened falls back to
/// [`LogOutput`] so the rest of the device keeps running.
pub fn from_config(config: &OutputConfig) -> Box<dyn OutputDriver + Send> {
    match config.kind {
        OutputKind::Pwm => match PwmOutput::open(config) {
            Ok(pwm) => Box::new(pwm),
            Err(e) => {
                warn!("PWM output unavailable ({}), falling back to log output", e);
                Box::new(LogOutput::new(config.range))
            }
        },
        OutputKind::Log => {
            info!("Using log output");
            Box::new(LogOutput::new(config.range))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_bounds_onto_native_range() {
        assert_eq!(drive_value(LightLevel::MIN, 1023), 0);
        assert_eq!(drive_value(LightLevel::MAX, 1023), 1023);
        assert_eq!(drive_value(LightLevel::clamped(50), 1000), 500);
        assert_eq!(drive_value(LightLevel::clamped(42), 1023), 429);
    }

    #[test]
    fn mapping_is_monotonic() {
        let mut previous = 0;
        for value in 0..=100 {
            let drive = drive_value(LightLevel::clamped(value), 255);
            assert!(drive >= previous);
            previous = drive;
        }
    }

    #[test]
    fn log_output_keeps_latest_value() {
        let mut output = LogOutput::new(100);
        output.apply(LightLevel::clamped(10));
        output.apply(LightLevel::clamped(70));
        assert_eq!(output.last_drive(), Some(70));
    }
}
