//! Node settings baked in at build time
//!
//! `build.rs` reads `.env` and exports every key with a default, so each
//! `env!` below always resolves.

use core::str::FromStr;

use ecoguard_core::config::{Config, ConfigError, MqttConfig, NodeConfig, TransportConfig};
use ecoguard_core::sensors::SoundMode;
use ecoguard_core::transport::BleLayout;

pub fn load() -> Result<Config<'static>, ConfigError> {
    let mut config = Config {
        node: NodeConfig {
            device_name: env!("ECOGUARD_DEVICE_NAME"),
            device_id: env!("ECOGUARD_DEVICE_ID"),
            parent_device_id: non_empty(env!("ECOGUARD_PARENT_DEVICE_ID")),
            room_id: env!("ECOGUARD_ROOM_ID"),
        },
        ..Config::default()
    };

    config.sampling.period_ms = parse("ECOGUARD_PERIOD_MS", env!("ECOGUARD_PERIOD_MS"))?;
    config.sampling.sound_mode = match env!("ECOGUARD_SOUND_MODE") {
        "amplitude" => SoundMode::Amplitude,
        "decibels" => SoundMode::Decibels,
        _ => return Err(invalid("ECOGUARD_SOUND_MODE", "expected amplitude or decibels")),
    };

    config.transport = match env!("ECOGUARD_TRANSPORT") {
        "ble" => TransportConfig::Ble {
            layout: match env!("ECOGUARD_BLE_LAYOUT") {
                "json_tx" => BleLayout::JsonTx,
                "per_sensor" => BleLayout::PerSensor,
                _ => return Err(invalid("ECOGUARD_BLE_LAYOUT", "expected json_tx or per_sensor")),
            },
        },
        "mqtt" => TransportConfig::Mqtt(MqttConfig {
            ssid: env!("WIFI_SSID"),
            password: env!("WIFI_PASSWORD"),
            broker_host: env!("MQTT_BROKER_HOST"),
            broker_port: parse("MQTT_BROKER_PORT", env!("MQTT_BROKER_PORT"))?,
            client_id: non_empty(env!("MQTT_CLIENT_ID")),
            ..MqttConfig::default()
        }),
        _ => return Err(invalid("ECOGUARD_TRANSPORT", "expected ble or mqtt")),
    };

    // No DNS resolver on the device
    if let TransportConfig::Mqtt(mqtt) = &config.transport {
        mqtt.broker_ipv4()?;
    }

    Ok(config)
}

fn parse<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(field, "not a number"))
}

fn non_empty(value: &'static str) -> Option<&'static str> {
    (!value.is_empty()).then_some(value)
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue { field, reason }
}
