//! Hardware-independent telemetry core for the EcoGuard sensor node
//!
//! An EcoGuard node samples a BMP280 barometer, a microphone and an HC-SR04
//! ultrasonic ranger on a fixed cadence, turns every reading into a
//! [`record::TelemetryRecord`] and pushes it over BLE notifications or MQTT.
//! Peers can put the node to sleep, wake it up or reboot it.
//!
//! The crate holds the sampling, encoding, connection supervision and command
//! handling logic. Hardware and radio stacks stay outside: sensors are reached
//! through small capability traits and transports talk to their radio task
//! through a [`transport::Link`].
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both the
//! ESP32 and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod command;
pub mod config;
pub mod controller;
pub mod node_state;
pub mod record;
pub mod sampling;
pub mod sensors;
pub mod supervisor;
pub mod transport;

/// Tests that drive `Timer`s share one global mock clock.
#[cfg(test)]
pub(crate) mod test_clock {
    extern crate std;

    use std::sync::{Mutex, MutexGuard};

    static CLOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
        CLOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Let every other branch of a `select` run until it blocks again.
    pub(crate) async fn settle() {
        for _ in 0..16 {
            embassy_futures::yield_now().await;
        }
    }
}
