//! Telemetry records and their wire formats
//!
//! A [`TelemetryRecord`] has the same field set whichever transport carries
//! it. Two renderings exist:
//!
//! - JSON (`to_json`): the MQTT payload and the single BLE TX characteristic
//! - plain (`to_plain`): the bare number written to a per-sensor BLE characteristic
//!
//! Values are rendered with a fixed number of decimals (`21.50`, `1013.25`),
//! amplitudes as integers.

use core::fmt::Write;

use thiserror_no_std::Error;

use crate::node_state::{Identifier, NodeState};
use crate::sensors::{Reading, SensorType, Unit};

/// Upper bound of a JSON record (the source firmware used a 256-byte buffer)
pub const MAX_JSON_LEN: usize = 256;
pub const MAX_PLAIN_LEN: usize = 24;

pub type JsonPayload = heapless::String<MAX_JSON_LEN>;
pub type PlainPayload = heapless::String<MAX_PLAIN_LEN>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoded record exceeds {0} bytes")]
    Overflow(usize),
}

/// One sensor value ready for transport. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub device_id: Identifier,
    pub parent_device_id: Identifier,
    pub room_id: Identifier,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: Unit,
    /// Milliseconds since boot at capture time
    pub timestamp: u64,
}

/// Turn a reading into a record stamped with the node identity.
///
/// Returns `None` for a failed reading: no record is ever built around a
/// missing value.
pub fn encode(reading: &Reading, state: &NodeState) -> Option<TelemetryRecord> {
    let value = reading.value?;

    Some(TelemetryRecord {
        device_id: state.identity.device_id.clone(),
        parent_device_id: state.identity.parent_device_id.clone(),
        room_id: state.identity.room_id.clone(),
        sensor_type: reading.sensor_type,
        value,
        unit: reading.unit,
        timestamp: reading.captured_at.as_millis(),
    })
}

impl TelemetryRecord {
    pub fn to_json(&self) -> Result<JsonPayload, EncodeError> {
        let mut json = JsonPayload::new();
        self.write_json(&mut json)
            .map_err(|_| EncodeError::Overflow(MAX_JSON_LEN))?;
        Ok(json)
    }

    pub fn to_plain(&self) -> Result<PlainPayload, EncodeError> {
        let mut text = PlainPayload::new();
        self.write_value(&mut text)
            .map_err(|_| EncodeError::Overflow(MAX_PLAIN_LEN))?;
        Ok(text)
    }

    fn write_json(&self, out: &mut impl Write) -> core::fmt::Result {
        write!(
            out,
            "{{\"device_id\":\"{}\",\"parent_device_id\":\"{}\",\"room_id\":\"{}\",\"sensor_type\":\"{}\",\"value\":",
            self.device_id,
            self.parent_device_id,
            self.room_id,
            self.sensor_type.as_str(),
        )?;
        self.write_value(out)?;
        write!(
            out,
            ",\"unit\":\"{}\",\"timestamp\":{}}}",
            self.unit.symbol(),
            self.timestamp
        )
    }

    fn write_value(&self, out: &mut impl Write) -> core::fmt::Result {
        write!(out, "{:.*}", self.unit.decimals(), self.value)
    }
}
