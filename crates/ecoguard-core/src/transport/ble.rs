//! BLE GATT notification transport
//!
//! The node is a peripheral exposing one service. Telemetry goes out as
//! notifications; a peer writes commands to the RX characteristic.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::link::{Link, LinkEvent, LinkRequest};
use super::{ConnectionState, ConnectionStateMachine, Delivery, TransportChannel, TransportError};
use crate::record::{JsonPayload, MAX_JSON_LEN, TelemetryRecord};
use crate::sensors::SensorType;

pub const SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";
/// Notify: JSON records
pub const TX_CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";
/// Write: commands
pub const RX_CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a9";

pub const TEMPERATURE_CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26b0";
pub const PRESSURE_CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26b1";
pub const SOUND_CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26b2";
pub const DISTANCE_CHARACTERISTIC_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26b3";

pub const DEFAULT_DEVICE_NAME: &str = "ESP32_Capteurs";

/// One full tick of notifications plus some slack
pub const BLE_FRAME_CAPACITY: usize = 8;

pub type BleLink = Link<NotifyFrame, BLE_FRAME_CAPACITY>;

/// How records are laid out over GATT
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BleLayout {
    /// Every record as JSON on the TX characteristic
    #[default]
    JsonTx,
    /// Bare value on one characteristic per sensor type
    PerSensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Tx,
    Sensor(SensorType),
}

impl Characteristic {
    pub const fn uuid(&self) -> &'static str {
        match self {
            Characteristic::Tx => TX_CHARACTERISTIC_UUID,
            Characteristic::Sensor(SensorType::Temperature) => TEMPERATURE_CHARACTERISTIC_UUID,
            Characteristic::Sensor(SensorType::Pressure) => PRESSURE_CHARACTERISTIC_UUID,
            Characteristic::Sensor(SensorType::Sound) => SOUND_CHARACTERISTIC_UUID,
            Characteristic::Sensor(SensorType::Distance) => DISTANCE_CHARACTERISTIC_UUID,
        }
    }
}

/// A notification waiting for the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyFrame {
    pub characteristic: Characteristic,
    pub payload: JsonPayload,
}

pub struct BleNotifyChannel<'a> {
    link: &'a BleLink,
    layout: BleLayout,
    machine: ConnectionStateMachine,
    /// A connected peer has notifications enabled, whatever our state
    peer_subscribed: bool,
}

impl<'a> BleNotifyChannel<'a> {
    pub fn new(link: &'a BleLink, layout: BleLayout) -> Self {
        Self {
            link,
            layout,
            machine: ConnectionStateMachine::new(),
            peer_subscribed: false,
        }
    }

    pub fn layout(&self) -> BleLayout {
        self.layout
    }

    fn frame_for(&self, record: &TelemetryRecord) -> Result<NotifyFrame, TransportError> {
        match self.layout {
            BleLayout::JsonTx => Ok(NotifyFrame {
                characteristic: Characteristic::Tx,
                payload: record.to_json()?,
            }),
            BleLayout::PerSensor => {
                let mut payload = JsonPayload::new();
                payload
                    .push_str(record.to_plain()?.as_str())
                    .map_err(|_| TransportError::PayloadTooLarge(MAX_JSON_LEN))?;
                Ok(NotifyFrame {
                    characteristic: Characteristic::Sensor(record.sensor_type),
                    payload,
                })
            }
        }
    }
}

impl TransportChannel for BleNotifyChannel<'_> {
    fn current_state(&self) -> ConnectionState {
        self.machine.state()
    }

    fn poll(&mut self) -> ConnectionState {
        while let Some(event) = self.link.try_next_event() {
            match event {
                LinkEvent::AdvertisingStarted => debug!("BLE advertising"),
                LinkEvent::PeerConnected => info!("BLE peer connected, waiting for subscription"),
                LinkEvent::PeerSubscribed => {
                    self.peer_subscribed = true;
                    if self.machine.handshake_complete() {
                        info!("BLE peer subscribed to notifications");
                    }
                }
                LinkEvent::PeerUnsubscribed | LinkEvent::PeerDisconnected => {
                    if self.machine.state() != ConnectionState::Disconnected {
                        info!("BLE peer gone ({:?})", event);
                    }
                    self.peer_subscribed = false;
                    self.machine.link_lost();
                    self.link.discard_frames();
                }
                LinkEvent::HandshakeFailed => {
                    warn!("BLE advertising failed");
                    self.peer_subscribed = false;
                    self.machine.link_lost();
                }
                LinkEvent::BrokerConnected | LinkEvent::BrokerDisconnected => {
                    warn!("ignoring {:?} on a BLE link", event);
                }
            }
        }

        self.machine.state()
    }

    /// Advertise, or resume at once when the peer is still connected and
    /// already subscribed again.
    fn connect(&mut self) -> Result<(), TransportError> {
        if !self.machine.begin() {
            return Ok(());
        }

        if self.peer_subscribed {
            self.machine.handshake_complete();
            info!("BLE peer still subscribed, resuming notifications");
        } else {
            self.link.request(LinkRequest::Connect);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.machine.link_lost();
        self.link.request(LinkRequest::Abort);
    }

    /// A no-op unless a peer is subscribed.
    fn send(&mut self, record: &TelemetryRecord) -> Result<Delivery, TransportError> {
        if self.machine.state() != ConnectionState::Connected {
            return Ok(Delivery::Dropped);
        }

        let frame = self.frame_for(record)?;
        self.link.try_send_frame(frame)?;
        Ok(Delivery::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_state::{NodeIdentity, NodeState};
    use crate::record;
    use crate::sensors::{Reading, SensorChannel, Unit};
    use embassy_time::Instant;

    fn record(sensor_type: SensorType, unit: Unit, value: f64) -> TelemetryRecord {
        let state = NodeState::new(NodeIdentity::new("esp32_sensor_001", "C4").unwrap());
        let reading = Reading::new(
            "bmp280",
            SensorChannel::new(sensor_type, unit),
            value,
            Instant::from_millis(1000),
        );
        record::encode(&reading, &state).unwrap()
    }

    fn subscribed(link: &BleLink, layout: BleLayout) -> BleNotifyChannel<'_> {
        let mut channel = BleNotifyChannel::new(link, layout);
        channel.connect().unwrap();
        link.try_report(LinkEvent::AdvertisingStarted);
        link.try_report(LinkEvent::PeerConnected);
        link.try_report(LinkEvent::PeerSubscribed);
        assert_eq!(channel.poll(), ConnectionState::Connected);
        channel
    }

    #[test]
    fn test_send_without_subscriber_is_noop() {
        let link = BleLink::new();
        let mut channel = BleNotifyChannel::new(&link, BleLayout::JsonTx);
        let record = record(SensorType::Temperature, Unit::Celsius, 21.5);

        assert_eq!(channel.send(&record), Ok(Delivery::Dropped));

        channel.connect().unwrap();
        link.try_report(LinkEvent::PeerConnected);
        assert_eq!(channel.poll(), ConnectionState::Connecting);
        assert_eq!(channel.send(&record), Ok(Delivery::Dropped));
        assert_eq!(link.try_next_frame(), None);
    }

    #[test]
    fn test_connect_starts_advertising() {
        let link = BleLink::new();
        let mut channel = BleNotifyChannel::new(&link, BleLayout::JsonTx);

        channel.connect().unwrap();
        assert_eq!(channel.current_state(), ConnectionState::Connecting);
        assert_eq!(link.try_take_request(), Some(LinkRequest::Connect));

        channel.connect().unwrap();
        assert_eq!(link.try_take_request(), None);
    }

    #[test]
    fn test_json_layout_notifies_tx() {
        let link = BleLink::new();
        let mut channel = subscribed(&link, BleLayout::JsonTx);

        let record = record(SensorType::Temperature, Unit::Celsius, 21.5);
        assert_eq!(channel.send(&record), Ok(Delivery::Queued));

        let frame = link.try_next_frame().unwrap();
        assert_eq!(frame.characteristic.uuid(), TX_CHARACTERISTIC_UUID);
        assert_eq!(frame.payload, record.to_json().unwrap());
    }

    #[test]
    fn test_per_sensor_layout_writes_plain_value() {
        let link = BleLink::new();
        let mut channel = subscribed(&link, BleLayout::PerSensor);

        channel
            .send(&record(SensorType::Pressure, Unit::HectoPascal, 1006.53))
            .unwrap();

        let frame = link.try_next_frame().unwrap();
        assert_eq!(frame.characteristic, Characteristic::Sensor(SensorType::Pressure));
        assert_eq!(frame.characteristic.uuid(), PRESSURE_CHARACTERISTIC_UUID);
        assert_eq!(frame.payload.as_str(), "1006.53");
    }

    #[test]
    fn test_unsubscribe_disconnects_and_drops_pending() {
        let link = BleLink::new();
        let mut channel = subscribed(&link, BleLayout::JsonTx);

        channel
            .send(&record(SensorType::Sound, Unit::AdcCounts, 300.0))
            .unwrap();
        link.try_report(LinkEvent::PeerUnsubscribed);

        assert_eq!(channel.poll(), ConnectionState::Disconnected);
        assert_eq!(link.try_next_frame(), None);
    }

    #[test]
    fn test_queue_full_is_reported() {
        let link = BleLink::new();
        let mut channel = subscribed(&link, BleLayout::JsonTx);
        let record = record(SensorType::Distance, Unit::Centimeter, 10.0);

        for _ in 0..BLE_FRAME_CAPACITY {
            assert_eq!(channel.send(&record), Ok(Delivery::Queued));
        }
        assert_eq!(channel.send(&record), Err(TransportError::QueueFull));
    }

    #[test]
    fn test_resubscribe_during_backoff_resumes() {
        use crate::supervisor::{Backoff, ConnectionSupervisor};
        use embassy_time::Duration;

        let link = BleLink::new();
        let mut sup = ConnectionSupervisor::new(
            BleNotifyChannel::new(&link, BleLayout::JsonTx),
            Backoff::new(Duration::from_millis(500), Duration::from_millis(30_000)),
        );
        let ms = Instant::from_millis;

        sup.step(ms(0));
        link.try_report(LinkEvent::PeerConnected);
        link.try_report(LinkEvent::PeerSubscribed);
        assert_eq!(sup.step(ms(100)), ConnectionState::Connected);
        assert_eq!(link.try_take_request(), Some(LinkRequest::Connect));

        // Notifications toggled off and on while the peer stays connected
        link.try_report(LinkEvent::PeerUnsubscribed);
        assert_eq!(sup.step(ms(200)), ConnectionState::Disconnected);
        link.try_report(LinkEvent::PeerSubscribed);
        assert_eq!(sup.step(ms(300)), ConnectionState::Disconnected);

        assert_eq!(sup.step(ms(700)), ConnectionState::Connected);
        assert_eq!(link.try_take_request(), None);

        let record = record(SensorType::Temperature, Unit::Celsius, 21.5);
        assert_eq!(sup.deliver(&record), Ok(Delivery::Queued));
    }

    #[test]
    fn test_disconnect_forgets_subscription() {
        let link = BleLink::new();
        let mut channel = subscribed(&link, BleLayout::JsonTx);
        link.try_take_request();

        link.try_report(LinkEvent::PeerDisconnected);
        assert_eq!(channel.poll(), ConnectionState::Disconnected);

        channel.connect().unwrap();
        assert_eq!(channel.current_state(), ConnectionState::Connecting);
        assert_eq!(link.try_take_request(), Some(LinkRequest::Connect));
    }
}
