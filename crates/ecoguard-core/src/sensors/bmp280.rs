use crate::sensors::{SensorChannel, SensorError, SensorReadings, SensorType, Unit};

use super::Sensor;
use embedded_hal_async::i2c::I2c;
use log::{error, info};

/// I2C address with SDO tied low
pub const DEFAULT_ADDRESS: u8 = 0x76;

const SENSOR_NAME: &str = "BMP280";
const CHIP_ID: u8 = 0x58;

const REG_CALIBRATION: u8 = 0x88;
const REG_CHIP_ID: u8 = 0xD0;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;

// Temperature x2, pressure x16, normal mode
const CTRL_MEAS_NORMAL: u8 = (0b010 << 5) | (0b101 << 2) | 0b11;
// 62.5 ms standby, IIR filter coefficient 16
const CONFIG_FILTERED: u8 = (0b001 << 5) | (0b100 << 2);

// ADC value reported for a skipped or not yet completed measurement
const ADC_SKIPPED: i32 = 0x80000;

/// Factory trimming parameters stored in registers 0x88..0x9F
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub dig_t1: u16,
    pub dig_t2: i16,
    pub dig_t3: i16,
    pub dig_p1: u16,
    pub dig_p2: i16,
    pub dig_p3: i16,
    pub dig_p4: i16,
    pub dig_p5: i16,
    pub dig_p6: i16,
    pub dig_p7: i16,
    pub dig_p8: i16,
    pub dig_p9: i16,
}

impl Calibration {
    /// Decode the little-endian calibration block.
    pub fn from_bytes(b: &[u8; 24]) -> Self {
        let u = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([b[i], b[i + 1]]);

        Self {
            dig_t1: u(0),
            dig_t2: s(2),
            dig_t3: s(4),
            dig_p1: u(6),
            dig_p2: s(8),
            dig_p3: s(10),
            dig_p4: s(12),
            dig_p5: s(14),
            dig_p6: s(16),
            dig_p7: s(18),
            dig_p8: s(20),
            dig_p9: s(22),
        }
    }

    /// Returns `(temperature_celsius, t_fine)`.
    pub fn compensate_temperature(&self, adc_t: i32) -> (f64, f64) {
        let adc_t = adc_t as f64;
        let t1 = self.dig_t1 as f64;

        let var1 = (adc_t / 16384.0 - t1 / 1024.0) * self.dig_t2 as f64;
        let delta = adc_t / 131072.0 - t1 / 8192.0;
        let var2 = delta * delta * self.dig_t3 as f64;

        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pressure in pascal, `None` when the calibration would divide by zero.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: f64) -> Option<f64> {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * self.dig_p6 as f64 / 32768.0;
        var2 += var1 * self.dig_p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.dig_p4 as f64 * 65536.0;
        var1 = (self.dig_p3 as f64 * var1 * var1 / 524288.0 + self.dig_p2 as f64 * var1)
            / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.dig_p1 as f64;

        if var1 == 0.0 {
            return None;
        }

        let mut p = 1048576.0 - adc_p as f64;
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.dig_p9 as f64 * p * p / 2147483648.0;
        let var2 = p * self.dig_p8 as f64 / 32768.0;

        Some(p + (var1 + var2 + self.dig_p7 as f64) / 16.0)
    }
}

/// Typed readings from the BMP280 sensor.
pub struct Bmp280Readings {
    pub temperature_celsius: f64,
    pub pressure_hpa: f64,
}

impl SensorReadings<2> for Bmp280Readings {
    fn to_array(self) -> [f64; 2] {
        [self.temperature_celsius, self.pressure_hpa]
    }
}

pub struct Bmp280Sensor<I> {
    i2c: I,
    address: u8,
    calibration: Option<Calibration>,
}

impl<I: I2c> Bmp280Sensor<I> {
    pub fn new(i2c: I) -> Self {
        Self::with_address(i2c, DEFAULT_ADDRESS)
    }

    pub fn with_address(i2c: I, address: u8) -> Self {
        Self {
            i2c,
            address,
            calibration: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.calibration.is_some()
    }

    /// Check the chip id, load calibration and start normal-mode conversions.
    /// Called lazily from `read`, so a sensor missing at boot is retried on every tick.
    async fn initialize(&mut self) -> Result<Calibration, SensorError> {
        let mut id = [0u8; 1];
        self.i2c
            .write_read(self.address, &[REG_CHIP_ID], &mut id)
            .await
            .map_err(|e| {
                error!("BMP280 chip id read failed: {:?}", e);
                SensorError::InitializationFailed {
                    sensor: SENSOR_NAME,
                    details: "I2C communication error or sensor not responding",
                }
            })?;

        if id[0] != CHIP_ID {
            error!("BMP280 unexpected chip id 0x{:02x}", id[0]);
            return Err(SensorError::InitializationFailed {
                sensor: SENSOR_NAME,
                details: "unexpected chip id",
            });
        }

        let mut raw = [0u8; 24];
        self.i2c
            .write_read(self.address, &[REG_CALIBRATION], &mut raw)
            .await
            .map_err(|e| {
                error!("BMP280 calibration read failed: {:?}", e);
                SensorError::InitializationFailed {
                    sensor: SENSOR_NAME,
                    details: "failed to read calibration block",
                }
            })?;

        for (register, value) in [(REG_CONFIG, CONFIG_FILTERED), (REG_CTRL_MEAS, CTRL_MEAS_NORMAL)] {
            self.i2c
                .write(self.address, &[register, value])
                .await
                .map_err(|e| {
                    error!("BMP280 register 0x{:02x} write failed: {:?}", register, e);
                    SensorError::InitializationFailed {
                        sensor: SENSOR_NAME,
                        details: "failed to configure measurement mode",
                    }
                })?;
        }

        let calibration = Calibration::from_bytes(&raw);
        self.calibration = Some(calibration);
        info!("BMP280: calibrated, normal mode started");

        Ok(calibration)
    }
}

impl<I: I2c> Sensor<2> for Bmp280Sensor<I> {
    type Readings = Bmp280Readings;

    fn sensor_id(&self) -> &'static str {
        "bmp280"
    }

    fn channels(&self) -> [SensorChannel; 2] {
        [
            SensorChannel::new(SensorType::Temperature, Unit::Celsius),
            SensorChannel::new(SensorType::Pressure, Unit::HectoPascal),
        ]
    }

    async fn read(&mut self) -> Result<Bmp280Readings, SensorError> {
        let calibration = match self.calibration {
            Some(calibration) => calibration,
            None => self.initialize().await?,
        };

        let mut data = [0u8; 6];
        self.i2c
            .write_read(self.address, &[REG_DATA], &mut data)
            .await
            .map_err(|e| {
                error!("BMP280 data read failed: {:?}", e);
                SensorError::ReadFailed {
                    sensor: SENSOR_NAME,
                    operation: "burst read pressure/temperature",
                    details: "I2C communication error",
                }
            })?;

        let adc_p = ((data[0] as i32) << 12) | ((data[1] as i32) << 4) | ((data[2] as i32) >> 4);
        let adc_t = ((data[3] as i32) << 12) | ((data[4] as i32) << 4) | ((data[5] as i32) >> 4);

        if adc_t == ADC_SKIPPED || adc_p == ADC_SKIPPED {
            return Err(SensorError::ReadFailed {
                sensor: SENSOR_NAME,
                operation: "burst read pressure/temperature",
                details: "measurement not available yet",
            });
        }

        let (temperature_celsius, t_fine) = calibration.compensate_temperature(adc_t);
        let pressure_pa =
            calibration
                .compensate_pressure(adc_p, t_fine)
                .ok_or(SensorError::ReadFailed {
                    sensor: SENSOR_NAME,
                    operation: "compensate pressure",
                    details: "invalid calibration data",
                })?;

        Ok(Bmp280Readings {
            temperature_celsius,
            pressure_hpa: pressure_pa / 100.0,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embedded_hal_async::i2c::{ErrorKind, ErrorType, Operation};

    fn close(actual: f64, expected: f64, tolerance: f64) -> bool {
        actual > expected - tolerance && actual < expected + tolerance
    }

    /// Register-file stand-in for a BMP280 on the bus
    pub(crate) struct FakeBmp280 {
        pub regs: [u8; 256],
        pub pointer: usize,
        pub offline: bool,
    }

    impl FakeBmp280 {
        /// A chip loaded with the datasheet example calibration and ADC values
        pub(crate) fn datasheet() -> Self {
            let mut regs = [0u8; 256];
            regs[REG_CHIP_ID as usize] = CHIP_ID;

            let words: [u16; 12] = [
                27504,
                26435,
                (-1000i16) as u16,
                36477,
                (-10685i16) as u16,
                3024,
                2855,
                140,
                (-7i16) as u16,
                15500,
                (-14600i16) as u16,
                6000,
            ];
            for (i, word) in words.iter().enumerate() {
                let at = REG_CALIBRATION as usize + i * 2;
                regs[at..at + 2].copy_from_slice(&word.to_le_bytes());
            }

            // adc_P = 415148, adc_T = 519888
            regs[REG_DATA as usize..REG_DATA as usize + 6]
                .copy_from_slice(&[0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00]);

            Self {
                regs,
                pointer: 0,
                offline: false,
            }
        }
    }

    impl ErrorType for FakeBmp280 {
        type Error = ErrorKind;
    }

    impl I2c for FakeBmp280 {
        async fn transaction(
            &mut self,
            _address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if self.offline {
                return Err(ErrorKind::Other);
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        if let Some((&register, values)) = bytes.split_first() {
                            self.pointer = register as usize;
                            for (i, v) in values.iter().enumerate() {
                                self.regs[self.pointer + i] = *v;
                            }
                        }
                    }
                    Operation::Read(buf) => {
                        let len = buf.len();
                        buf.copy_from_slice(&self.regs[self.pointer..self.pointer + len]);
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_datasheet_compensation() {
        let mut sensor = Bmp280Sensor::new(FakeBmp280::datasheet());
        let readings = block_on(sensor.read()).ok().unwrap();

        assert!(close(readings.temperature_celsius, 25.0825, 0.001));
        assert!(close(readings.pressure_hpa, 1006.5327, 0.001));
    }

    #[test]
    fn test_initialization_configures_normal_mode() {
        let mut sensor = Bmp280Sensor::new(FakeBmp280::datasheet());
        assert!(!sensor.is_initialized());

        block_on(sensor.read()).ok().unwrap();

        assert!(sensor.is_initialized());
        assert_eq!(sensor.i2c.regs[REG_CTRL_MEAS as usize], CTRL_MEAS_NORMAL);
        assert_eq!(sensor.i2c.regs[REG_CONFIG as usize], CONFIG_FILTERED);
    }

    #[test]
    fn test_missing_chip_is_retried_on_next_read() {
        let mut fake = FakeBmp280::datasheet();
        fake.offline = true;
        let mut sensor = Bmp280Sensor::new(fake);

        let err = block_on(sensor.read()).err().unwrap();
        assert!(matches!(err, SensorError::InitializationFailed { .. }));
        assert!(!sensor.is_initialized());

        sensor.i2c.offline = false;
        assert!(block_on(sensor.read()).is_ok());
    }

    #[test]
    fn test_wrong_chip_id_is_rejected() {
        let mut fake = FakeBmp280::datasheet();
        fake.regs[REG_CHIP_ID as usize] = 0x60;
        let mut sensor = Bmp280Sensor::new(fake);

        let err = block_on(sensor.read()).err().unwrap();
        assert_eq!(
            err,
            SensorError::InitializationFailed {
                sensor: "BMP280",
                details: "unexpected chip id",
            }
        );
    }

    #[test]
    fn test_skipped_measurement_is_a_read_failure() {
        let mut fake = FakeBmp280::datasheet();
        fake.regs[REG_DATA as usize + 3..REG_DATA as usize + 6].copy_from_slice(&[0x80, 0, 0]);
        let mut sensor = Bmp280Sensor::new(fake);

        let err = block_on(sensor.read()).err().unwrap();
        assert!(matches!(err, SensorError::ReadFailed { .. }));
    }
}
