use crate::sensors::{SensorChannel, SensorError, SensorReadings, SensorType, Unit};

use super::Sensor;
use embassy_time::Duration;
use log::warn;

const SENSOR_NAME: &str = "HC-SR04";

/// Longest echo the sampler waits for (about 5 m round trip)
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(30);

// Speed of sound in cm/µs, halved for the round trip in `read`
const SOUND_CM_PER_US: f64 = 0.0343;

/// Hardware side of an ultrasonic ranger: fire the trigger pulse and time the echo.
pub trait EchoPulse {
    type Error: core::fmt::Debug;

    /// Width of the echo pulse in microseconds, `0` when no echo arrived within `timeout`.
    fn measure_echo_us(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<u32, Self::Error>>;
}

/// Typed readings from the HC-SR04 sensor.
pub struct Hcsr04Readings {
    pub distance_cm: f64,
}

impl SensorReadings<1> for Hcsr04Readings {
    fn to_array(self) -> [f64; 1] {
        [self.distance_cm]
    }
}

pub struct Hcsr04Sensor<E> {
    echo: E,
}

impl<E: EchoPulse> Hcsr04Sensor<E> {
    pub fn new(echo: E) -> Self {
        Self { echo }
    }
}

impl<E: EchoPulse> Sensor<1> for Hcsr04Sensor<E> {
    type Readings = Hcsr04Readings;

    fn sensor_id(&self) -> &'static str {
        "hcsr04"
    }

    fn channels(&self) -> [SensorChannel; 1] {
        [SensorChannel::new(SensorType::Distance, Unit::Centimeter)]
    }

    async fn read(&mut self) -> Result<Hcsr04Readings, SensorError> {
        let echo_us = self
            .echo
            .measure_echo_us(ECHO_TIMEOUT)
            .await
            .map_err(|e| {
                warn!("HC-SR04 echo measurement failed: {:?}", e);
                SensorError::ReadFailed {
                    sensor: SENSOR_NAME,
                    operation: "measure echo pulse",
                    details: "GPIO error",
                }
            })?;

        if echo_us == 0 {
            return Err(SensorError::Timeout {
                sensor: SENSOR_NAME,
                operation: "wait for echo",
            });
        }

        Ok(Hcsr04Readings {
            distance_cm: echo_us as f64 * SOUND_CM_PER_US / 2.0,
        })
    }
}
