//! ESP32 side of the EcoGuard node
//!
//! Everything hardware specific lives here: the sensor capability impls on
//! top of esp-hal, the BLE GATT server and the Wi-Fi/MQTT session tasks that
//! drain the core's [`ecoguard_core::transport::Link`]s, and the settings baked
//! in by `build.rs`.

#![no_std]

extern crate alloc;

pub mod ble;
pub mod hardware;
pub mod mqtt;
pub mod settings;
