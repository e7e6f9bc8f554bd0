//! Wire messages exchanged between the server and the edge devices.
//!
//! # Wire format
//! Every frame is UTF-8 text: the lowercase message tag, then — only for
//! types that carry a payload — a single `|` separator followed by the
//! payload serialized as JSON. Payload field names use short aliases to
//! save uplink bandwidth.
//!
//! ```text
//! ping
//! edge_version|{"v":"1.4.2"}
//! device_data|{"sid":"a81xQ2","d":{"42":{"ts":[1705320000],"v":[21.5]}}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::driver_config::DriverMetadata;

/// Separator between the message tag and its JSON payload.
pub const MESSAGE_SEPARATOR: char = '|';

/// Length of the opaque staging id carried by data messages.
pub const STAGING_ID_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// All message types of the edge protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Asks the peer to respond with [`MessageType::Pong`].
    Ping,
    /// Response to a [`MessageType::Ping`].
    Pong,
    /// Carries the edge software version known to the sender. The server
    /// sends this right after a device connects so the device can decide
    /// whether it needs to update itself.
    EdgeVersion,
    /// Sent by the device after connecting: its full driver and signal
    /// inventory, so the server can create the matching metadata rows.
    DeviceConfig,
    /// Server response to [`MessageType::DeviceConfig`]: the
    /// driver → signal → server timeseries id index.
    DeviceConfigResponse,
    /// A staged batch of samples, grouped by server timeseries id.
    DeviceData,
    /// Server confirmation that a staged batch has been persisted.
    DeviceDataAck,
}

impl MessageType {
    /// The lowercase wire tag of this message type.
    pub fn tag(self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::EdgeVersion => "edge_version",
            MessageType::DeviceConfig => "device_config",
            MessageType::DeviceConfigResponse => "device_config_response",
            MessageType::DeviceData => "device_data",
            MessageType::DeviceDataAck => "device_data_ack",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "edge_version" => MessageType::EdgeVersion,
            "device_config" => MessageType::DeviceConfig,
            "device_config_response" => MessageType::DeviceConfigResponse,
            "device_data" => MessageType::DeviceData,
            "device_data_ack" => MessageType::DeviceDataAck,
            _ => return None,
        })
    }

    /// Whether messages of this type carry a payload.
    pub fn has_payload(self) -> bool {
        !matches!(self, MessageType::Ping | MessageType::Pong)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of an [`MessageType::EdgeVersion`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeVersionPayload {
    /// Semantic version of the edge software, e.g. `"1.4.2"`.
    #[serde(rename = "v")]
    pub version: String,
}

/// One series inside a [`DeviceDataPayload`].
///
/// `timestamps_utc` and `values` are parallel arrays of equal length.
/// Timestamps are UTC unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DriverTimeseries {
    #[serde(rename = "ts")]
    pub timestamps_utc: Vec<i64>,
    #[serde(rename = "v")]
    pub values: Vec<f64>,
}

/// Payload of a [`MessageType::DeviceData`] message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDataPayload {
    /// Opaque id tagging the staged rows on the device; echoed back in the
    /// ack so the device can delete exactly this batch.
    #[serde(rename = "sid")]
    pub staging_id: String,
    /// Server timeseries id → samples.
    #[serde(rename = "d")]
    pub data: BTreeMap<i64, DriverTimeseries>,
}

/// Payload of a [`MessageType::DeviceDataAck`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDataAckPayload {
    #[serde(rename = "sid")]
    pub staging_id: String,
}

/// Payload of a [`MessageType::DeviceConfig`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfigPayload {
    /// The driver inventory of the device.
    pub drivers: Vec<DriverMetadata>,
}

/// Payload of a [`MessageType::DeviceConfigResponse`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfigResponsePayload {
    /// Driver identifier → signal identifier → server timeseries id.
    pub timeseries_index: BTreeMap<String, BTreeMap<String, i64>>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A decoded protocol message: the type tag together with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeMessage {
    Ping,
    Pong,
    EdgeVersion(EdgeVersionPayload),
    DeviceConfig(DeviceConfigPayload),
    DeviceConfigResponse(DeviceConfigResponsePayload),
    DeviceData(DeviceDataPayload),
    DeviceDataAck(DeviceDataAckPayload),
}

/// Reasons a frame fails to decode into an [`EdgeMessage`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported message type: {0}")]
    UnknownTag(String),
    #[error("missing payload for message type {0}")]
    MissingPayload(MessageType),
    #[error("message type {0} does not carry a payload")]
    UnexpectedPayload(MessageType),
    #[error("invalid payload for message type {message_type}: {source}")]
    InvalidPayload {
        message_type: MessageType,
        source: serde_json::Error,
    },
}

impl EdgeMessage {
    /// The type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            EdgeMessage::Ping => MessageType::Ping,
            EdgeMessage::Pong => MessageType::Pong,
            EdgeMessage::EdgeVersion(_) => MessageType::EdgeVersion,
            EdgeMessage::DeviceConfig(_) => MessageType::DeviceConfig,
            EdgeMessage::DeviceConfigResponse(_) => MessageType::DeviceConfigResponse,
            EdgeMessage::DeviceData(_) => MessageType::DeviceData,
            EdgeMessage::DeviceDataAck(_) => MessageType::DeviceDataAck,
        }
    }

    /// Build the wire form of this message.
    ///
    /// The inverse of [`EdgeMessage::decode`]: `decode(&m.encode()) == Ok(m)`
    /// for every message.
    pub fn encode(&self) -> String {
        fn with_payload<P: Serialize>(message_type: MessageType, payload: &P) -> String {
            // Serialization of our payload types cannot fail: all maps have
            // string-representable keys and all values are plain data.
            let json = serde_json::to_string(payload).expect("payload serialization");
            format!("{}{}{}", message_type.tag(), MESSAGE_SEPARATOR, json)
        }

        match self {
            EdgeMessage::Ping => MessageType::Ping.tag().to_owned(),
            EdgeMessage::Pong => MessageType::Pong.tag().to_owned(),
            EdgeMessage::EdgeVersion(p) => with_payload(MessageType::EdgeVersion, p),
            EdgeMessage::DeviceConfig(p) => with_payload(MessageType::DeviceConfig, p),
            EdgeMessage::DeviceConfigResponse(p) => {
                with_payload(MessageType::DeviceConfigResponse, p)
            }
            EdgeMessage::DeviceData(p) => with_payload(MessageType::DeviceData, p),
            EdgeMessage::DeviceDataAck(p) => with_payload(MessageType::DeviceDataAck, p),
        }
    }

    /// Parse a message from its wire form.
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let (tag, payload) = match frame.split_once(MESSAGE_SEPARATOR) {
            Some((tag, payload)) => (tag, Some(payload)),
            None => (frame, None),
        };

        let message_type = MessageType::from_tag(tag)
            .ok_or_else(|| CodecError::UnknownTag(tag.to_owned()))?;

        if !message_type.has_payload() {
            if payload.is_some() {
                return Err(CodecError::UnexpectedPayload(message_type));
            }
            return Ok(match message_type {
                MessageType::Ping => EdgeMessage::Ping,
                MessageType::Pong => EdgeMessage::Pong,
                _ => unreachable!("only ping/pong are payload-less"),
            });
        }

        let payload = match payload {
            Some(p) if !p.is_empty() => p,
            _ => return Err(CodecError::MissingPayload(message_type)),
        };

        fn parse<'a, P: Deserialize<'a>>(
            message_type: MessageType,
            payload: &'a str,
        ) -> Result<P, CodecError> {
            serde_json::from_str(payload).map_err(|source| CodecError::InvalidPayload {
                message_type,
                source,
            })
        }

        Ok(match message_type {
            MessageType::EdgeVersion => {
                EdgeMessage::EdgeVersion(parse(message_type, payload)?)
            }
            MessageType::DeviceConfig => {
                EdgeMessage::DeviceConfig(parse(message_type, payload)?)
            }
            MessageType::DeviceConfigResponse => {
                EdgeMessage::DeviceConfigResponse(parse(message_type, payload)?)
            }
            MessageType::DeviceData => EdgeMessage::DeviceData(parse(message_type, payload)?),
            MessageType::DeviceDataAck => {
                EdgeMessage::DeviceDataAck(parse(message_type, payload)?)
            }
            MessageType::Ping | MessageType::Pong => {
                unreachable!("handled by the payload-less branch above")
            }
        })
    }
}
