//! Bakes the node settings from `.env` (or the build environment) into the
//! firmware as `env!` values read by `settings.rs`.

const SETTINGS: &[(&str, &str)] = &[
    ("ECOGUARD_TRANSPORT", "ble"),
    ("ECOGUARD_BLE_LAYOUT", "json_tx"),
    ("ECOGUARD_DEVICE_NAME", "ESP32_Capteurs"),
    ("ECOGUARD_DEVICE_ID", "esp32_sensor_001"),
    ("ECOGUARD_PARENT_DEVICE_ID", ""),
    ("ECOGUARD_ROOM_ID", "C4"),
    ("ECOGUARD_PERIOD_MS", "1000"),
    ("ECOGUARD_SOUND_MODE", "amplitude"),
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    ("MQTT_BROKER_HOST", ""),
    ("MQTT_BROKER_PORT", "1883"),
    ("MQTT_CLIENT_ID", ""),
];

fn main() {
    println!("cargo:rerun-if-changed=.env");

    if let Err(e) = dotenvy::dotenv() {
        println!("cargo:warning=no .env loaded ({e}), using defaults");
    }

    for (key, default) in SETTINGS {
        println!("cargo:rerun-if-env-changed={key}");
        let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
        println!("cargo:rustc-env={key}={value}");
    }
}
