//! Outbound telemetry transports
//!
//! A [`TransportChannel`] owns one outbound connection and its
//! [`ConnectionState`]. The radio stack itself runs in another task; the two
//! sides meet at a [`link::Link`], so every method here is non-blocking.

pub mod ble;
pub mod link;
pub mod mqtt;

pub use ble::{BleLayout, BleNotifyChannel};
pub use link::{Link, LinkEvent, LinkRequest};
pub use mqtt::MqttPublishChannel;

use log::debug;
use thiserror_no_std::Error;

use crate::record::{EncodeError, TelemetryRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("payload does not fit a {0}-byte frame")]
    PayloadTooLarge(usize),
    #[error("record encoding failed: {0}")]
    Encode(EncodeError),
}

impl From<EncodeError> for TransportError {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

/// What happened to a record accepted by `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the radio stack
    Queued,
    /// Silently discarded (BLE with no subscribed peer)
    Dropped,
}

/// Capability interface shared by the BLE and MQTT variants.
pub trait TransportChannel {
    fn current_state(&self) -> ConnectionState;

    /// Drain pending stack events and return the resulting state. Never blocks;
    /// must be called on every tick to keep the link serviced.
    fn poll(&mut self) -> ConnectionState;

    /// Start a connection attempt. Only meaningful from `Disconnected`.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Give up on the attempt in progress and return to `Disconnected`.
    fn abort(&mut self);

    fn send(&mut self, record: &TelemetryRecord) -> Result<Delivery, TransportError>;
}

/// Connection lifecycle shared by every transport.
///
/// `Connected` is only entered from `Connecting`; `Disconnected` can be
/// entered from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub const fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// `Disconnected -> Connecting`. Returns false if an attempt or link already exists.
    pub fn begin(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// `Connecting -> Connected`. Ignored in any other state.
    pub fn handshake_complete(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Connected;
                true
            }
            other => {
                debug!("handshake completion ignored in state {:?}", other);
                false
            }
        }
    }

    /// Any state `-> Disconnected`
    pub fn link_lost(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}
