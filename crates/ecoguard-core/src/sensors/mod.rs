//! Sensor abstractions and hardware adapters
//!
//! Each physical sensor implements [`Sensor`] and produces a fixed number of
//! values per read. The sampler turns those values into [`Reading`]s, one per
//! [`SensorChannel`], so a single device (the BMP280) can feed several
//! telemetry streams.

pub mod bmp280;
pub mod hcsr04;
pub mod microphone;

pub use bmp280::{Bmp280Readings, Bmp280Sensor};
pub use hcsr04::{EchoPulse, Hcsr04Readings, Hcsr04Sensor};
pub use microphone::{AnalogSource, MicrophoneReadings, MicrophoneSensor, SoundMode};

use embassy_time::Instant;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor}: {operation} failed ({details})")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
        details: &'static str,
    },
    #[error("{sensor}: timed out during {operation}")]
    Timeout {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("{sensor}: initialization failed ({details})")]
    InitializationFailed {
        sensor: &'static str,
        details: &'static str,
    },
}

impl SensorError {
    /// Name of the sensor that raised the error
    pub const fn sensor(&self) -> &'static str {
        match self {
            Self::ReadFailed { sensor, .. }
            | Self::Timeout { sensor, .. }
            | Self::InitializationFailed { sensor, .. } => sensor,
        }
    }
}

/// Physical quantity carried by a telemetry stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Temperature,
    Pressure,
    Sound,
    Distance,
}

impl SensorType {
    pub const ALL: [SensorType; 4] = [
        SensorType::Temperature,
        SensorType::Pressure,
        SensorType::Sound,
        SensorType::Distance,
    ];

    /// Name used in records and MQTT topics
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Pressure => "pressure",
            Self::Sound => "sound",
            Self::Distance => "distance",
        }
    }
}

/// Unit attached to a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Celsius,
    HectoPascal,
    Centimeter,
    /// Raw peak-to-peak ADC counts
    AdcCounts,
    /// Relative level, 20·log10 of the ADC amplitude
    Decibel,
}

impl Unit {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Celsius => "C",
            Self::HectoPascal => "hPa",
            Self::Centimeter => "cm",
            Self::AdcCounts => "adc",
            Self::Decibel => "dB",
        }
    }

    /// Number of fractional digits used when the value is rendered as text
    pub const fn decimals(self) -> usize {
        match self {
            Self::AdcCounts => 0,
            _ => 2,
        }
    }
}

/// One output stream of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorChannel {
    pub sensor_type: SensorType,
    pub unit: Unit,
}

impl SensorChannel {
    pub const fn new(sensor_type: SensorType, unit: Unit) -> Self {
        Self { sensor_type, unit }
    }
}

/// A single sampled value.
///
/// `value` is `None` only when the hardware read failed or timed out; such a
/// reading is never encoded into a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensor_id: &'static str,
    pub sensor_type: SensorType,
    pub value: Option<f64>,
    pub unit: Unit,
    pub captured_at: Instant,
}

impl Reading {
    /// Build a reading from a raw value. Non-finite values count as a failed read.
    pub fn new(
        sensor_id: &'static str,
        channel: SensorChannel,
        value: f64,
        captured_at: Instant,
    ) -> Self {
        Self {
            sensor_id,
            sensor_type: channel.sensor_type,
            value: value.is_finite().then_some(value),
            unit: channel.unit,
            captured_at,
        }
    }

    /// Reading for a channel whose hardware read failed
    pub fn failed(sensor_id: &'static str, channel: SensorChannel, captured_at: Instant) -> Self {
        Self {
            sensor_id,
            sensor_type: channel.sensor_type,
            value: None,
            unit: channel.unit,
            captured_at,
        }
    }
}

/// Trait for sensor reading data structures.
/// Provides compile-time guarantees about the number of values and their conversion to arrays.
pub trait SensorReadings<const COUNT: usize> {
    /// Convert the readings into a fixed-size array, in channel order.
    fn to_array(self) -> [f64; COUNT];
}

/// Trait for sensors that produce typed readings.
pub trait Sensor<const COUNT: usize> {
    /// The type of readings this sensor produces.
    type Readings: SensorReadings<COUNT>;

    /// Identifier reported as `sensor_id` on every reading.
    fn sensor_id(&self) -> &'static str;

    /// The channels this sensor feeds, matching the order of `Readings::to_array`.
    fn channels(&self) -> [SensorChannel; COUNT];

    /// Read the sensor and return typed readings.
    fn read(&mut self) -> impl Future<Output = Result<Self::Readings, SensorError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPERATURE: SensorChannel = SensorChannel::new(SensorType::Temperature, Unit::Celsius);

    #[test]
    fn test_non_finite_values_become_failed_readings() {
        let at = Instant::from_millis(10);
        assert_eq!(Reading::new("bmp280", TEMPERATURE, f64::NAN, at).value, None);
        assert_eq!(
            Reading::new("bmp280", TEMPERATURE, f64::INFINITY, at).value,
            None
        );
        assert_eq!(Reading::new("bmp280", TEMPERATURE, 21.5, at).value, Some(21.5));
    }

    #[test]
    fn test_sensor_type_names_match_wire_format() {
        let names: [&str; 4] = SensorType::ALL.map(SensorType::as_str);
        assert_eq!(names, ["temperature", "pressure", "sound", "distance"]);
    }

    #[test]
    fn test_amplitude_is_rendered_without_decimals() {
        assert_eq!(Unit::AdcCounts.decimals(), 0);
        assert_eq!(Unit::Celsius.decimals(), 2);
        assert_eq!(Unit::HectoPascal.symbol(), "hPa");
    }
}
