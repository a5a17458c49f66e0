use crate::sensors::{SensorChannel, SensorError, SensorReadings, SensorType, Unit};

use super::Sensor;
use embedded_hal_async::delay::DelayNs;
use log::warn;
use serde::{Deserialize, Serialize};

const SENSOR_NAME: &str = "MAX4466";

/// Amplitudes below this are clamped before the logarithm so silence does not yield -inf
pub const AMPLITUDE_FLOOR: u16 = 20;

pub const DEFAULT_SAMPLE_COUNT: u16 = 100;
pub const DEFAULT_SAMPLE_INTERVAL_US: u32 = 200;

/// How a burst of ADC samples is reduced to one sound reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundMode {
    /// Peak-to-peak amplitude in ADC counts
    #[default]
    Amplitude,
    /// `20 * log10(max(amplitude, 20))`
    Decibels,
}

/// Hardware side of the microphone: one raw ADC conversion.
pub trait AnalogSource {
    type Error: core::fmt::Debug;

    fn read_raw(&mut self) -> Result<u16, Self::Error>;
}

/// Typed readings from the microphone.
pub struct MicrophoneReadings {
    pub level: f64,
}

impl SensorReadings<1> for MicrophoneReadings {
    fn to_array(self) -> [f64; 1] {
        [self.level]
    }
}

pub struct MicrophoneSensor<A, D> {
    adc: A,
    delay: D,
    mode: SoundMode,
    samples: u16,
    interval_us: u32,
}

impl<A: AnalogSource, D: DelayNs> MicrophoneSensor<A, D> {
    pub fn new(adc: A, delay: D, mode: SoundMode) -> Self {
        Self {
            adc,
            delay,
            mode,
            samples: DEFAULT_SAMPLE_COUNT,
            interval_us: DEFAULT_SAMPLE_INTERVAL_US,
        }
    }

    /// Override the burst shape. A zero sample count is raised to one.
    pub fn with_burst(mut self, samples: u16, interval_us: u32) -> Self {
        self.samples = samples.max(1);
        self.interval_us = interval_us;
        self
    }

    /// Sample the ADC `samples` times and return max - min.
    async fn amplitude(&mut self) -> Result<u16, SensorError> {
        let mut min = u16::MAX;
        let mut max = u16::MIN;

        for _ in 0..self.samples {
            let value = self.adc.read_raw().map_err(|e| {
                warn!("Microphone ADC read failed: {:?}", e);
                SensorError::ReadFailed {
                    sensor: SENSOR_NAME,
                    operation: "sample ADC",
                    details: "ADC conversion error",
                }
            })?;
            min = min.min(value);
            max = max.max(value);
            self.delay.delay_us(self.interval_us).await;
        }

        Ok(max - min)
    }
}

/// Log level of an amplitude, with the floor applied.
pub fn level_from_amplitude(amplitude: u16) -> f64 {
    20.0 * libm::log10(amplitude.max(AMPLITUDE_FLOOR) as f64)
}

impl<A: AnalogSource, D: DelayNs> Sensor<1> for MicrophoneSensor<A, D> {
    type Readings = MicrophoneReadings;

    fn sensor_id(&self) -> &'static str {
        "mic"
    }

    fn channels(&self) -> [SensorChannel; 1] {
        let unit = match self.mode {
            SoundMode::Amplitude => Unit::AdcCounts,
            SoundMode::Decibels => Unit::Decibel,
        };
        [SensorChannel::new(SensorType::Sound, unit)]
    }

    async fn read(&mut self) -> Result<MicrophoneReadings, SensorError> {
        let amplitude = self.amplitude().await?;

        let level = match self.mode {
            SoundMode::Amplitude => amplitude as f64,
            SoundMode::Decibels => level_from_amplitude(amplitude),
        };

        Ok(MicrophoneReadings { level })
    }
}
