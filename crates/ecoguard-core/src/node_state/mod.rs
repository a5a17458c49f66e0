//! Process-wide node state and node-level error types

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use thiserror_no_std::Error;

use crate::config::ConfigError;
use crate::sensors::SensorError;
use crate::transport::TransportError;

/// Longest accepted device or room identifier, in bytes
pub const MAX_ID_LEN: usize = 32;

pub type Identifier = heapless::String<MAX_ID_LEN>;

/// Validate an identifier that ends up inside JSON strings and MQTT topic levels.
pub fn parse_identifier(field: &'static str, value: &str) -> Result<Identifier, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidIdentifier {
            field,
            reason: "must not be empty",
        });
    }

    if value
        .chars()
        .any(|c| matches!(c, '"' | '\\' | '/' | '+' | '#') || c.is_control())
    {
        return Err(ConfigError::InvalidIdentifier {
            field,
            reason: "contains a reserved character",
        });
    }

    let mut id = Identifier::new();
    id.push_str(value)
        .map_err(|_| ConfigError::InvalidIdentifier {
            field,
            reason: "longer than 32 bytes",
        })?;

    Ok(id)
}

/// Who this node is and where it is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub device_id: Identifier,
    /// Equal to `device_id` unless the node reports through a parent (e.g. a gateway)
    pub parent_device_id: Identifier,
    pub room_id: Identifier,
}

impl NodeIdentity {
    pub fn new(device_id: &str, room_id: &str) -> Result<Self, ConfigError> {
        let device_id = parse_identifier("device_id", device_id)?;

        Ok(Self {
            parent_device_id: device_id.clone(),
            device_id,
            room_id: parse_identifier("room_id", room_id)?,
        })
    }

    pub fn with_parent(mut self, parent_device_id: &str) -> Result<Self, ConfigError> {
        self.parent_device_id = parse_identifier("parent_device_id", parent_device_id)?;
        Ok(self)
    }
}

/// Mutable state of a running node. Reset to `NodeState::new` on reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub is_awake: bool,
    pub last_wake_time: Option<Instant>,
    pub identity: NodeIdentity,
}

impl NodeState {
    /// A freshly booted node samples immediately.
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            is_awake: true,
            last_wake_time: None,
            identity,
        }
    }

    pub fn wake(&mut self, at: Instant) {
        self.is_awake = true;
        self.last_wake_time = Some(at);
    }

    pub fn sleep(&mut self) {
        self.is_awake = false;
    }
}

/// `NodeState` shared between the sampling task and the command task.
///
/// Both sides only hold the lock for the duration of a closure, so a command
/// can flip `is_awake` while a tick is in the middle of a slow sensor read.
pub struct SharedNodeState {
    inner: Mutex<CriticalSectionRawMutex, RefCell<NodeState>>,
}

impl SharedNodeState {
    pub fn new(state: NodeState) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(state)),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> NodeState {
        self.inner.lock(|state| state.borrow().clone())
    }

    pub fn is_awake(&self) -> bool {
        self.inner.lock(|state| state.borrow().is_awake)
    }

    /// Run `f` with exclusive access to the state.
    pub fn update<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> R {
        self.inner.lock(|state| f(&mut state.borrow_mut()))
    }

    /// Return to boot defaults, keeping the identity.
    pub fn reset(&self) {
        self.update(|state| *state = NodeState::new(state.identity.clone()));
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("sensor {sensor} timed out")]
    SensorReadTimeout { sensor: &'static str },
    #[error("transport not connected")]
    TransportNotConnected,
    #[error("connection handshake failed")]
    HandshakeFailure,
    #[error("{component} failed to initialize")]
    FatalInitFailure { component: &'static str },
    #[error("configuration error: {0}")]
    Config(ConfigError),
    #[error("sensor error: {0}")]
    Sensor(SensorError),
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<ConfigError> for NodeError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<SensorError> for NodeError {
    fn from(value: SensorError) -> Self {
        match value {
            SensorError::Timeout { sensor, .. } => Self::SensorReadTimeout { sensor },
            other => Self::Sensor(other),
        }
    }
}

impl From<TransportError> for NodeError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::NotConnected => Self::TransportNotConnected,
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeIdentity {
        NodeIdentity::new("esp32_sensor_001", "C4").unwrap()
    }

    #[test]
    fn test_parent_defaults_to_device() {
        let id = identity();
        assert_eq!(id.parent_device_id, id.device_id);

        let id = id.with_parent("gateway_01").unwrap();
        assert_eq!(id.parent_device_id.as_str(), "gateway_01");
        assert_eq!(id.device_id.as_str(), "esp32_sensor_001");
    }

    #[test]
    fn test_identifiers_are_validated() {
        assert!(matches!(
            NodeIdentity::new("", "C4"),
            Err(ConfigError::InvalidIdentifier { field: "device_id", .. })
        ));
        assert!(NodeIdentity::new("node", "room/1").is_err());
        assert!(NodeIdentity::new("no\"de", "C4").is_err());
        assert!(NodeIdentity::new("node", "#").is_err());
        assert!(NodeIdentity::new("a-very-long-device-identifier-over-32", "C4").is_err());
    }

    #[test]
    fn test_boot_state_is_awake() {
        let state = NodeState::new(identity());
        assert!(state.is_awake);
        assert_eq!(state.last_wake_time, None);
    }

    #[test]
    fn test_shared_state_update_and_reset() {
        let shared = SharedNodeState::new(NodeState::new(identity()));

        shared.update(|s| s.sleep());
        assert!(!shared.is_awake());

        shared.update(|s| s.wake(Instant::from_millis(42)));
        assert_eq!(shared.snapshot().last_wake_time, Some(Instant::from_millis(42)));

        shared.update(|s| s.sleep());
        shared.reset();
        let state = shared.snapshot();
        assert!(state.is_awake);
        assert_eq!(state.last_wake_time, None);
        assert_eq!(state.identity, identity());
    }

    #[test]
    fn test_error_taxonomy_mapping() {
        let timeout = SensorError::Timeout {
            sensor: "HC-SR04",
            operation: "wait for echo",
        };
        assert_eq!(
            NodeError::from(timeout),
            NodeError::SensorReadTimeout { sensor: "HC-SR04" }
        );
        assert_eq!(
            NodeError::from(TransportError::NotConnected),
            NodeError::TransportNotConnected
        );
    }
}
