//! MQTT publish transport
//!
//! One retained publish per record on `ecoguard/sensors/<room_id>/<sensor_type>`.

use core::fmt::Write;

use log::{info, warn};

use super::link::{Link, LinkEvent, LinkRequest};
use super::{ConnectionState, ConnectionStateMachine, Delivery, TransportChannel, TransportError};
use crate::record::{EncodeError, JsonPayload, TelemetryRecord};
use crate::sensors::SensorType;

pub const TOPIC_ROOT: &str = "ecoguard/sensors";
pub const MAX_TOPIC_LEN: usize = 80;

pub const MQTT_FRAME_CAPACITY: usize = 8;

pub type Topic = heapless::String<MAX_TOPIC_LEN>;
pub type MqttLink = Link<PublishFrame, MQTT_FRAME_CAPACITY>;

pub fn topic_for(room_id: &str, sensor_type: SensorType) -> Result<Topic, EncodeError> {
    let mut topic = Topic::new();
    write!(topic, "{}/{}/{}", TOPIC_ROOT, room_id, sensor_type.as_str())
        .map_err(|_| EncodeError::Overflow(MAX_TOPIC_LEN))?;
    Ok(topic)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFrame {
    pub topic: Topic,
    pub payload: JsonPayload,
    pub retain: bool,
}

pub struct MqttPublishChannel<'a> {
    link: &'a MqttLink,
    machine: ConnectionStateMachine,
}

impl<'a> MqttPublishChannel<'a> {
    pub fn new(link: &'a MqttLink) -> Self {
        Self {
            link,
            machine: ConnectionStateMachine::new(),
        }
    }

    /// Records queued for a session that is gone are never published later.
    fn drop_stale_frames(&self) {
        let dropped = self.link.discard_frames();
        if dropped > 0 {
            warn!("dropped {} unpublished record(s)", dropped);
        }
    }
}

impl TransportChannel for MqttPublishChannel<'_> {
    fn current_state(&self) -> ConnectionState {
        self.machine.state()
    }

    fn poll(&mut self) -> ConnectionState {
        while let Some(event) = self.link.try_next_event() {
            match event {
                LinkEvent::BrokerConnected => {
                    if self.machine.handshake_complete() {
                        info!("MQTT session established");
                    }
                }
                LinkEvent::BrokerDisconnected => {
                    if self.machine.state() == ConnectionState::Connected {
                        warn!("MQTT broker connection lost");
                    }
                    self.machine.link_lost();
                    self.drop_stale_frames();
                }
                LinkEvent::HandshakeFailed => {
                    warn!("MQTT connection attempt failed");
                    self.machine.link_lost();
                    self.drop_stale_frames();
                }
                other => warn!("ignoring {:?} on an MQTT link", other),
            }
        }

        self.machine.state()
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.machine.begin() {
            self.link.request(LinkRequest::Connect);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.machine.link_lost();
        self.link.request(LinkRequest::Abort);
    }

    fn send(&mut self, record: &TelemetryRecord) -> Result<Delivery, TransportError> {
        if self.machine.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let frame = PublishFrame {
            topic: topic_for(record.room_id.as_str(), record.sensor_type)?,
            payload: record.to_json()?,
            retain: true,
        };
        self.link.try_send_frame(frame)?;
        Ok(Delivery::Queued)
    }
}
