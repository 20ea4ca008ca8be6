//! Packet envelope exchanged over the agent's duplex stream.
//!
//! The transport never looks inside `payload`: it carries whatever the
//! backend protocol (SQL, SSH, HTTP, ...) put there. `spec` holds small
//! per-packet attributes such as the session a data packet belongs to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Spec key naming the session a packet belongs to.
pub const SPEC_SESSION_ID: &str = "session_id";
/// Spec key naming the connection a session targets.
pub const SPEC_CONNECTION_NAME: &str = "connection_name";
/// Spec key carrying a machine-readable error code on `Error` packets.
pub const SPEC_ERROR_CODE: &str = "error_code";

/// Error code sent by a gateway that refused the agent's token.
pub const ERROR_CODE_UNAUTHENTICATED: &str = "unauthenticated";

/// Numeric packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PacketType {
    KeepAlive = 0x01,
    ConnectOk = 0x02,
    Error = 0x03,

    SessionOpen = 0x10,
    SessionOpenOk = 0x11,
    SessionClose = 0x12,
    ReviewWait = 0x13,

    Data = 0x20,
}

impl PacketType {
    /// Control packets steer the stream itself and never carry application data.
    pub fn is_control(self) -> bool {
        matches!(self, Self::KeepAlive | Self::ConnectOk | Self::Error)
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::KeepAlive),
            0x02 => Ok(Self::ConnectOk),
            0x03 => Ok(Self::Error),
            0x10 => Ok(Self::SessionOpen),
            0x11 => Ok(Self::SessionOpenOk),
            0x12 => Ok(Self::SessionClose),
            0x13 => Ok(Self::ReviewWait),
            0x20 => Ok(Self::Data),
            _ => Err(format!("unknown packet type: 0x{v:02x}")),
        }
    }
}

/// The smallest framed unit exchanged over the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    #[serde(with = "serde_bytes", default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub spec: BTreeMap<String, serde_bytes::ByteBuf>,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
            spec: BTreeMap::new(),
        }
    }

    /// Empty-payload keepalive control packet.
    pub fn keepalive() -> Self {
        Self::new(PacketType::KeepAlive, Vec::new())
    }

    /// Error control packet with a machine-readable code and a message payload.
    pub fn error(code: &str, message: &str) -> Self {
        Self::new(PacketType::Error, message.as_bytes().to_vec())
            .with_spec(SPEC_ERROR_CODE, code.as_bytes())
    }

    /// Attach a spec attribute, replacing any previous value under `key`.
    pub fn with_spec(mut self, key: &str, value: impl AsRef<[u8]>) -> Self {
        self.spec.insert(
            key.to_string(),
            serde_bytes::ByteBuf::from(value.as_ref().to_vec()),
        );
        self
    }

    /// Raw spec attribute.
    pub fn spec_bytes(&self, key: &str) -> Option<&[u8]> {
        self.spec.get(key).map(|v| v.as_slice())
    }

    /// Spec attribute as UTF-8, `None` when absent or not valid UTF-8.
    pub fn spec_str(&self, key: &str) -> Option<&str> {
        self.spec_bytes(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Session this packet belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.spec_str(SPEC_SESSION_ID)
    }

    /// Whether this is an `Error` packet telling us the token was refused.
    pub fn is_unauthenticated_error(&self) -> bool {
        self.packet_type == PacketType::Error
            && self.spec_str(SPEC_ERROR_CODE) == Some(ERROR_CODE_UNAUTHENTICATED)
    }
}
