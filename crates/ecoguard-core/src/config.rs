//! Node configuration
//!
//! Fields borrow from the source text: the firmware compiles its values in,
//! the simulator deserializes them from a JSON file it keeps alive for the
//! process lifetime.

use core::net::Ipv4Addr;

use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::node_state::NodeIdentity;
use crate::sensors::SoundMode;
use crate::supervisor::Backoff;
use crate::transport::ble::BleLayout;

/// Longest name that fits a legacy advertising packet next to the flags
pub const MAX_DEVICE_NAME_LEN: usize = 29;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidIdentifier {
        field: &'static str,
        reason: &'static str,
    },
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config<'a> {
    #[serde(borrow)]
    pub node: NodeConfig<'a>,
    #[serde(borrow)]
    pub transport: TransportConfig<'a>,
    pub sampling: SamplingConfig,
    pub retry: RetryConfig,
}

impl Default for Config<'_> {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            transport: TransportConfig::Ble {
                layout: BleLayout::default(),
            },
            sampling: SamplingConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config<'_> {
    /// Check every field and build the node identity.
    pub fn validate(&self) -> Result<NodeIdentity, ConfigError> {
        if self.node.device_name.is_empty() || self.node.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::InvalidValue {
                field: "device_name",
                reason: "must be 1 to 29 bytes",
            });
        }

        let identity = NodeIdentity::new(self.node.device_id, self.node.room_id)?;
        let identity = match self.node.parent_device_id {
            Some(parent) => identity.with_parent(parent)?,
            None => identity,
        };

        if self.sampling.period_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampling.period_ms",
                reason: "must be greater than zero",
            });
        }

        if self.sampling.sound_samples == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampling.sound_samples",
                reason: "must be greater than zero",
            });
        }

        if self.retry.initial_backoff_ms == 0 || self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry.initial_backoff_ms",
                reason: "must be non-zero and at most retry.max_backoff_ms",
            });
        }

        if let TransportConfig::Mqtt(mqtt) = &self.transport {
            if mqtt.broker_host.is_empty() || mqtt.ssid.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "transport.mqtt",
                    reason: "broker_host and ssid are required",
                });
            }
        }

        Ok(identity)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig<'a> {
    /// BLE advertising name
    pub device_name: &'a str,
    pub device_id: &'a str,
    #[serde(borrow)]
    pub parent_device_id: Option<&'a str>,
    pub room_id: &'a str,
}

impl Default for NodeConfig<'_> {
    fn default() -> Self {
        Self {
            device_name: "ESP32_Capteurs",
            device_id: "esp32_sensor_001",
            parent_device_id: None,
            room_id: "C4",
        }
    }
}

/// Which transport carries the telemetry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportConfig<'a> {
    Ble {
        #[serde(default)]
        layout: BleLayout,
    },
    Mqtt(#[serde(borrow)] MqttConfig<'a>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MqttConfig<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
    pub broker_host: &'a str,
    pub broker_port: u16,
    /// Defaults to the device id
    #[serde(borrow)]
    pub client_id: Option<&'a str>,
    pub keep_alive_secs: u16,
}

impl Default for MqttConfig<'_> {
    fn default() -> Self {
        Self {
            ssid: "",
            password: "",
            broker_host: "",
            broker_port: 1883,
            client_id: None,
            keep_alive_secs: 60,
        }
    }
}

impl MqttConfig<'_> {
    /// Broker as a literal address, for stacks without a resolver.
    pub fn broker_ipv4(&self) -> Result<Ipv4Addr, ConfigError> {
        self.broker_host.parse().map_err(|_| ConfigError::InvalidValue {
            field: "broker_host",
            reason: "must be an IPv4 address",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct SamplingConfig {
    pub period_ms: u64,
    pub sound_mode: SoundMode,
    pub sound_samples: u16,
    pub sound_interval_us: u32,
}

impl SamplingConfig {
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            sound_mode: SoundMode::Amplitude,
            sound_samples: crate::sensors::microphone::DEFAULT_SAMPLE_COUNT,
            sound_interval_us: crate::sensors::microphone::DEFAULT_SAMPLE_INTERVAL_US,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl RetryConfig {
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            handshake_timeout_ms: 10_000,
        }
    }
}
