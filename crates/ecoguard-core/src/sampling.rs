//! Sequential sampling of the node's sensors

extern crate alloc;
use alloc::vec::Vec;

use embassy_time::Instant;
use log::warn;

use crate::sensors::{Reading, Sensor, SensorReadings};

/// Produces one reading per configured sensor channel, in configuration order.
pub trait SensorSampler {
    fn sample_all(&mut self, now: Instant) -> impl Future<Output = Vec<Reading>>;
}

/// Read `sensor` and append one reading per channel to `out`.
///
/// A failed read yields `None`-valued readings for this sensor only.
pub async fn sample_into<S, const COUNT: usize>(sensor: &mut S, now: Instant, out: &mut Vec<Reading>)
where
    S: Sensor<COUNT>,
{
    let sensor_id = sensor.sensor_id();
    let channels = sensor.channels();

    match sensor.read().await {
        Ok(readings) => {
            for (channel, value) in channels.into_iter().zip(readings.to_array()) {
                out.push(Reading::new(sensor_id, channel, value, now));
            }
        }
        Err(e) => {
            warn!("{}: skipping this tick: {}", sensor_id, e);
            for channel in channels {
                out.push(Reading::failed(sensor_id, channel, now));
            }
        }
    }
}

/// The sensor set of the EcoGuard node: barometer, microphone and ultrasonic ranger.
pub struct NodeSensors<B, M, R> {
    pub barometer: B,
    pub microphone: M,
    pub ranger: R,
}

impl<B, M, R> NodeSensors<B, M, R>
where
    B: Sensor<2>,
    M: Sensor<1>,
    R: Sensor<1>,
{
    pub fn new(barometer: B, microphone: M, ranger: R) -> Self {
        Self {
            barometer,
            microphone,
            ranger,
        }
    }
}

impl<B, M, R> SensorSampler for NodeSensors<B, M, R>
where
    B: Sensor<2>,
    M: Sensor<1>,
    R: Sensor<1>,
{
    async fn sample_all(&mut self, now: Instant) -> Vec<Reading> {
        let mut readings = Vec::with_capacity(4);

        sample_into::<_, 2>(&mut self.barometer, now, &mut readings).await;
        sample_into::<_, 1>(&mut self.microphone, now, &mut readings).await;
        sample_into::<_, 1>(&mut self.ranger, now, &mut readings).await;

        readings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::bmp280::tests::FakeBmp280;
    use crate::sensors::hcsr04::tests::ScriptedEcho;
    use crate::sensors::microphone::tests::{NoDelay, ScriptedAdc};
    use crate::sensors::{
        Bmp280Sensor, Hcsr04Sensor, MicrophoneSensor, SensorType, SoundMode, Unit,
    };
    use embassy_futures::block_on;

    fn node(echo_us: u32) -> impl SensorSampler {
        NodeSensors::new(
            Bmp280Sensor::new(FakeBmp280::datasheet()),
            MicrophoneSensor::new(ScriptedAdc::new(&[100, 400]), NoDelay::default(), SoundMode::Amplitude),
            Hcsr04Sensor::new(ScriptedEcho(echo_us)),
        )
    }

    #[test]
    fn test_readings_follow_configuration_order() {
        let now = Instant::from_millis(1000);
        let readings = block_on(node(583).sample_all(now));

        let types: Vec<SensorType> = readings.iter().map(|r| r.sensor_type).collect();
        assert_eq!(
            types,
            [
                SensorType::Temperature,
                SensorType::Pressure,
                SensorType::Sound,
                SensorType::Distance,
            ]
        );
        assert!(readings.iter().all(|r| r.value.is_some() && r.captured_at == now));
        assert_eq!(readings[2].unit, Unit::AdcCounts);
        assert_eq!(readings[2].value, Some(300.0));
    }

    #[test]
    fn test_distance_timeout_only_affects_distance() {
        let readings = block_on(node(0).sample_all(Instant::from_millis(5)));

        assert_eq!(readings.len(), 4);
        assert_eq!(readings[3].sensor_id, "hcsr04");
        assert_eq!(readings[3].value, None);
        assert!(readings[..3].iter().all(|r| r.value.is_some()));
    }

    #[test]
    fn test_failed_barometer_yields_two_empty_readings() {
        let mut fake = FakeBmp280::datasheet();
        fake.offline = true;
        let mut sensors = NodeSensors::new(
            Bmp280Sensor::new(fake),
            MicrophoneSensor::new(ScriptedAdc::new(&[1]), NoDelay::default(), SoundMode::Amplitude),
            Hcsr04Sensor::new(ScriptedEcho(100)),
        );

        let readings = block_on(sensors.sample_all(Instant::from_millis(5)));

        assert_eq!(readings[0].value, None);
        assert_eq!(readings[1].value, None);
        assert_eq!(readings[1].sensor_type, SensorType::Pressure);
        assert!(readings[2].value.is_some());
        assert!(readings[3].value.is_some());
    }
}
