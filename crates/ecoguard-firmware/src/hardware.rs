//! esp-hal backed implementations of the core's sensor capability traits
//!
//! Wiring (ESP32 DevKit):
//!
//! | Sensor      | Pins                                 |
//! |-------------|--------------------------------------|
//! | BMP280      | I2C0, SDA GPIO21, SCL GPIO22, 0x76   |
//! | HC-SR04     | trigger GPIO26, echo GPIO27          |
//! | Microphone  | ADC1 on GPIO34                       |
//!
//! The BMP280 breakout runs in I2C mode, not the 4-wire SPI mode some
//! EcoGuard boards use (CS GPIO4, SCK GPIO18, SDO GPIO19, SDI GPIO23).
//! Rewiring an SPI board: CSB to 3V3 to select I2C, SDI to GPIO21 (SDA),
//! SCK to GPIO22 (SCL), SDO to GND for address 0x76. GPIO4/18/19/23 are
//! left free.

use core::convert::Infallible;

use ecoguard_core::command::Restart;
use ecoguard_core::node_state::NodeError;
use ecoguard_core::sensors::{AnalogSource, EchoPulse};
use embassy_time::{Duration, Instant, Timer, with_timeout};
use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcPin};
use esp_hal::delay::Delay;
use esp_hal::gpio::{Input, Output};
use esp_hal::peripherals::{ADC1, GPIO34};
use log::error;
use thiserror_no_std::Error;

/// Width of the HC-SR04 trigger pulse
const TRIGGER_PULSE_US: u32 = 10;

/// Conversions attempted before a microphone read gives up
const ADC_SPIN_LIMIT: u32 = 10_000;

/// Pause before resetting after a boot failure
pub const FATAL_RESTART_DELAY: Duration = Duration::from_secs(5);

/// HC-SR04 trigger and echo lines
pub struct UltrasonicPins<'d> {
    trigger: Output<'d>,
    echo: Input<'d>,
    delay: Delay,
}

impl<'d> UltrasonicPins<'d> {
    pub fn new(trigger: Output<'d>, echo: Input<'d>) -> Self {
        Self {
            trigger,
            echo,
            delay: Delay::new(),
        }
    }
}

impl EchoPulse for UltrasonicPins<'_> {
    type Error = Infallible;

    async fn measure_echo_us(&mut self, timeout: Duration) -> Result<u32, Infallible> {
        self.trigger.set_low();
        self.delay.delay_micros(2);
        self.trigger.set_high();
        self.delay.delay_micros(TRIGGER_PULSE_US);
        self.trigger.set_low();

        let deadline = Instant::now() + timeout;
        if with_timeout(timeout, self.echo.wait_for_high()).await.is_err() {
            return Ok(0);
        }

        let rising = Instant::now();
        let remaining = deadline.saturating_duration_since(rising);
        if with_timeout(remaining, self.echo.wait_for_low()).await.is_err() {
            return Ok(0);
        }

        Ok(Instant::now().saturating_duration_since(rising).as_micros() as u32)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("ADC conversion did not complete")]
pub struct AdcTimeout;

/// Microphone output on ADC1
pub struct MicrophoneAdc<'d> {
    adc: Adc<'d, ADC1<'d>, Blocking>,
    pin: AdcPin<GPIO34<'d>, ADC1<'d>>,
}

impl<'d> MicrophoneAdc<'d> {
    pub fn new(adc: Adc<'d, ADC1<'d>, Blocking>, pin: AdcPin<GPIO34<'d>, ADC1<'d>>) -> Self {
        Self { adc, pin }
    }
}

impl AnalogSource for MicrophoneAdc<'_> {
    type Error = AdcTimeout;

    fn read_raw(&mut self) -> Result<u16, AdcTimeout> {
        for _ in 0..ADC_SPIN_LIMIT {
            if let Ok(value) = self.adc.read_oneshot(&mut self.pin) {
                return Ok(value);
            }
        }
        Err(AdcTimeout)
    }
}

/// Chip reset used by the reboot command
pub struct SoftwareReset;

impl Restart for SoftwareReset {
    fn restart(&mut self) {
        esp_hal::system::software_reset();
    }
}

/// Log a boot failure and reset the chip after [`FATAL_RESTART_DELAY`].
pub async fn restart_after_failure(component: &'static str, details: impl core::fmt::Debug) -> ! {
    error!(
        "{} ({:?}), restarting in {} s",
        NodeError::FatalInitFailure { component },
        details,
        FATAL_RESTART_DELAY.as_secs()
    );
    Timer::after(FATAL_RESTART_DELAY).await;

    loop {
        SoftwareReset.restart();
        Timer::after(FATAL_RESTART_DELAY).await;
    }
}
