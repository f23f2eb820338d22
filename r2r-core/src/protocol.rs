//! R2R wire protocol: message types and version.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent in every header and negotiated during the handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// All message kinds. The wire value of each variant is its lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    Command,
    Status,
    Telemetry,
    Error,
    Heartbeat,
    Negotiation,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::Handshake,
        MessageType::HandshakeAck,
        MessageType::Command,
        MessageType::Status,
        MessageType::Telemetry,
        MessageType::Error,
        MessageType::Heartbeat,
        MessageType::Negotiation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::HandshakeAck => "handshake_ack",
            MessageType::Command => "command",
            MessageType::Status => "status",
            MessageType::Telemetry => "telemetry",
            MessageType::Error => "error",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Negotiation => "negotiation",
        }
    }

    /// Handshake-phase messages are the only ones processed before the session is established.
    pub fn is_handshake(self) -> bool {
        matches!(self, MessageType::Handshake | MessageType::HandshakeAck)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire string that is not one of the eight message types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type {0:?}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

/// Two versions are compatible when their major components match ("1.0" and "1.3" are; "1.0" and "2.0" are not).
pub fn versions_compatible(a: &str, b: &str) -> bool {
    match (major(a), major(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Seconds since the Unix epoch on the local clock (0 if the clock is before the epoch).
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn major(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}
