//! Characteristic value events published during enumeration.
//!
//! Enumeration never calls into the rest of the system directly. Callers
//! that want live values (signal capture, observation storage) pass a
//! [`CharacteristicSink`] in the enumeration options.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::DeviceAddress;

/// One observed characteristic operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CharacteristicEvent {
    /// A value was read.
    Read {
        /// Device address.
        address: DeviceAddress,
        /// Characteristic UUID.
        uuid: Uuid,
        /// Value read.
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
        /// When it was read.
        timestamp: DateTime<Utc>,
    },
    /// A value was written successfully.
    Write {
        /// Device address.
        address: DeviceAddress,
        /// Characteristic UUID.
        uuid: Uuid,
        /// Value written.
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
        /// When it was written.
        timestamp: DateTime<Utc>,
    },
}

impl CharacteristicEvent {
    /// A read event stamped now.
    #[must_use]
    pub fn read(address: DeviceAddress, uuid: Uuid, value: Vec<u8>) -> Self {
        Self::Read {
            address,
            uuid,
            value,
            timestamp: Utc::now(),
        }
    }

    /// A write event stamped now.
    #[must_use]
    pub fn write(address: DeviceAddress, uuid: Uuid, value: Vec<u8>) -> Self {
        Self::Write {
            address,
            uuid,
            value,
            timestamp: Utc::now(),
        }
    }

    /// Characteristic the event concerns.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        match self {
            Self::Read { uuid, .. } | Self::Write { uuid, .. } => *uuid,
        }
    }
}

mod hex_bytes {
    use serde::Serializer;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}

/// Receives characteristic events.
///
/// Called inline on the enumeration path, so implementations must not block.
pub trait CharacteristicSink: Send + Sync {
    /// Handles one event.
    fn publish(&self, event: CharacteristicEvent);
}

/// Forwards events into an unbounded tokio channel.
///
/// Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CharacteristicEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver paired with it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CharacteristicEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl From<mpsc::UnboundedSender<CharacteristicEvent>> for ChannelSink {
    fn from(tx: mpsc::UnboundedSender<CharacteristicEvent>) -> Self {
        Self { tx }
    }
}

impl CharacteristicSink for ChannelSink {
    fn publish(&self, event: CharacteristicEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uuid_from_u16;

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::channel();
        let address: DeviceAddress = "AA:BB:CC:DD:EE:30".parse().unwrap();
        sink.publish(CharacteristicEvent::read(address, uuid_from_u16(0x2A19), vec![0x64]));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.uuid(), uuid_from_u16(0x2A19));
        assert!(matches!(event, CharacteristicEvent::Read { ref value, .. } if value == &[0x64]));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        let address: DeviceAddress = "AA:BB:CC:DD:EE:30".parse().unwrap();
        sink.publish(CharacteristicEvent::write(address, uuid_from_u16(0x2A06), vec![1]));
    }

    #[test]
    fn test_event_serializes_value_as_hex() {
        let address: DeviceAddress = "AA:BB:CC:DD:EE:30".parse().unwrap();
        let event = CharacteristicEvent::write(address, uuid_from_u16(0x2A06), vec![0xBE, 0xEF]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "write");
        assert_eq!(json["value"], "beef");
        assert_eq!(json["address"], "AA:BB:CC:DD:EE:30");
    }
}
