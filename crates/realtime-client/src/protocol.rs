//! Wire protocol types, constants, and the codec seam.
//!
//! The state machines only depend on the fields declared here; byte layout is
//! owned by the [`Codec`] implementation (MessagePack by default).

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorInfo, error_code};

// ---------------------------------------------------------------------------
// Protocol action constants
// ---------------------------------------------------------------------------

pub mod action {
    pub const HEARTBEAT: i32 = 0;
    pub const ACK: i32 = 1;
    pub const NACK: i32 = 2;
    pub const CONNECT: i32 = 3;
    pub const CONNECTED: i32 = 4;
    pub const DISCONNECT: i32 = 5;
    pub const DISCONNECTED: i32 = 6;
    pub const CLOSE: i32 = 7;
    pub const CLOSED: i32 = 8;
    pub const ERROR: i32 = 9;
    pub const ATTACH: i32 = 10;
    pub const ATTACHED: i32 = 11;
    pub const DETACH: i32 = 12;
    pub const DETACHED: i32 = 13;
    pub const PRESENCE: i32 = 14;
    pub const MESSAGE: i32 = 15;
    pub const SYNC: i32 = 16;
    pub const AUTH: i32 = 17;
}

pub mod flags {
    pub const HAS_PRESENCE: i32 = 1;
    pub const HAS_BACKLOG: i32 = 2;
    pub const HAS_CHANNEL_RESUMED: i32 = 4;
    pub const ATTACH_RESUME: i32 = 1 << 5; // 32
}

// ---------------------------------------------------------------------------
// Wire protocol types
// ---------------------------------------------------------------------------

// NOTE: We intentionally omit `skip_serializing_if = "Option::is_none"` on
// these structs. rmp_serde has a long-standing bug where skipped Option fields
// cause deserialization failures: https://github.com/3Hren/msgpack-rust/issues/86
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: i32,
    pub id: Option<String>,
    pub channel: Option<String>,
    pub channel_serial: Option<String>,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_details: Option<ConnectionDetails>,
    /// Deprecated in protocol v3+; retained for wire compatibility.
    pub connection_serial: Option<i64>,
    pub msg_serial: Option<i64>,
    pub count: Option<i64>,
    pub flags: Option<i32>,
    pub error: Option<ErrorInfo>,
    pub auth: Option<AuthDetails>,
    pub messages: Option<Vec<Message>>,
    pub presence: Option<Vec<PresenceMessage>>,
    pub timestamp: Option<i64>,
    pub params: Option<HashMap<String, String>>,
}

impl ProtocolMessage {
    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_state_ttl: Option<i64>,
    pub max_idle_interval: Option<i64>,
    pub max_message_size: Option<i64>,
    pub max_frame_size: Option<i64>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// A channel message. Used both on the wire and for delivery to subscribers
/// (the encoding layers are resolved at ingestion, see [`decode_data`]).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    pub id: Option<String>,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub timestamp: Option<i64>,
    pub encoding: Option<String>,
}

/// Presence delta actions, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresenceAction {
    #[default]
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            0 => Some(PresenceAction::Absent),
            1 => Some(PresenceAction::Present),
            2 => Some(PresenceAction::Enter),
            3 => Some(PresenceAction::Leave),
            4 => Some(PresenceAction::Update),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            PresenceAction::Absent => 0,
            PresenceAction::Present => 1,
            PresenceAction::Enter => 2,
            PresenceAction::Leave => 3,
            PresenceAction::Update => 4,
        }
    }
}

impl Serialize for PresenceAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for PresenceAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = i64::deserialize(deserializer)?;
        PresenceAction::from_wire(v)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid presence action {v}")))
    }
}

/// A presence delta about one member.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceMessage {
    pub id: Option<String>,
    pub action: PresenceAction,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: Option<serde_json::Value>,
    pub timestamp: Option<i64>,
    pub encoding: Option<String>,
}

impl PresenceMessage {
    /// Membership key: `connectionId:clientId`. At most one live entry per key.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.connection_id.as_deref().unwrap_or(""),
            self.client_id.as_deref().unwrap_or("")
        )
    }
}

// ---------------------------------------------------------------------------
// Codec seam
// ---------------------------------------------------------------------------

/// Message serialization boundary. Opaque to state-machine logic.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &ProtocolMessage) -> Result<Vec<u8>, Error>;
    fn decode(&self, data: &[u8]) -> Result<ProtocolMessage, Error>;
}

/// MessagePack codec (the protocol default).
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode(&self, msg: &ProtocolMessage) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec_named(msg)?)
    }

    fn decode(&self, data: &[u8]) -> Result<ProtocolMessage, Error> {
        decode_msg(data)
    }
}

pub fn encode_msg(msg: &ProtocolMessage) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

pub fn decode_msg(data: &[u8]) -> Result<ProtocolMessage, Error> {
    // Three-step decode: msgpack → rmpv::Value → serde_json::Value → ProtocolMessage.
    //
    // 1. rmpv::Value handles msgpack binary data (which serde_json::Value cannot).
    // 2. serde_json::Value deduplicates map keys (the server may send a field
    //    twice, which rmp_serde's struct deserializer rejects).
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor).map_err(|e| {
        Error::Protocol(ErrorInfo::new(
            error_code::BAD_REQUEST,
            format!("msgpack decode error: {e}"),
        ))
    })?;
    let json = rmpv_to_json(value);
    serde_json::from_value(json).map_err(|e| {
        Error::Protocol(ErrorInfo::new(
            error_code::BAD_REQUEST,
            format!("message decode error: {e}"),
        ))
    })
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64 strings.
fn rmpv_to_json(value: rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::String(s) => {
            if s.is_str() {
                serde_json::Value::String(s.into_str().unwrap_or_default().to_string())
            } else {
                tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
                serde_json::Value::String(String::new())
            }
        }
        rmpv::Value::Binary(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(map) => {
            let obj = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => {
                            if s.is_str() {
                                s.into_str().unwrap_or_default().to_string()
                            } else {
                                tracing::warn!(
                                    "msgpack map key contains invalid UTF-8, substituting empty string"
                                );
                                String::new()
                            }
                        }
                        other => format!("{other}"),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect();
            serde_json::Value::Object(obj)
        }
        rmpv::Value::Ext(_, bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            serde_json::Value::String(encoded)
        }
    }
}

// ---------------------------------------------------------------------------
// Payload encoding layers
// ---------------------------------------------------------------------------

/// Resolve the `encoding` layers of an inbound payload (`json`, `base64`,
/// `utf-8`), falling back to the raw value when a layer cannot be applied.
pub fn decode_data(data: serde_json::Value, encoding: Option<&str>) -> serde_json::Value {
    let Some(encoding) = encoding else {
        return data;
    };
    if encoding.is_empty() {
        return data;
    }
    let mut result = data;
    for layer in encoding.rsplit('/') {
        match layer {
            "json" => {
                if let serde_json::Value::String(ref s) = result {
                    match serde_json::from_str(s) {
                        Ok(parsed) => result = parsed,
                        Err(e) => {
                            tracing::warn!("failed to decode JSON encoding layer: {e}");
                            return result;
                        }
                    }
                }
            }
            "base64" => {
                // serde_json::Value has no binary type, so decoded bytes are
                // represented as a JSON array of numbers.
                if let serde_json::Value::String(ref s) = result {
                    match base64::engine::general_purpose::STANDARD.decode(s) {
                        Ok(bytes) => {
                            result = serde_json::Value::Array(
                                bytes.into_iter().map(|b| b.into()).collect(),
                            );
                        }
                        Err(e) => {
                            tracing::warn!("failed to decode base64 encoding layer: {e}");
                            return result;
                        }
                    }
                }
            }
            "utf-8" => {
                // No-op: MessagePack strings are already UTF-8
            }
            other => {
                tracing::warn!(
                    encoding = other,
                    "unsupported encoding layer, returning raw data"
                );
                return result;
            }
        }
    }
    result
}
