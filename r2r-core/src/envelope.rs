//! Message envelope: versioned header plus typed payload.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::payload::{Payload, PayloadError};
use crate::protocol::{MessageType, PROTOCOL_VERSION};

/// Envelope header. `target_id` of `None` means broadcast and is left off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: String,
    pub timestamp: u64,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

impl Header {
    pub fn new(source_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            timestamp,
            source_id: source_id.into(),
            target_id: None,
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// One complete protocol message. The message type is always the payload's type.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub payload: Payload,
}

// Wire layout: `{"header": .., "type": .., "payload": ..}` in that key order.
#[derive(Serialize)]
struct WireOut<'a> {
    header: &'a Header,
    #[serde(rename = "type")]
    ty: MessageType,
    payload: &'a Payload,
}

// Top-level fields, kept raw until the type is known.
#[derive(Deserialize)]
struct WireIn {
    header: Option<Value>,
    #[serde(rename = "type")]
    ty: Option<Value>,
    payload: Option<Value>,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireOut {
            header: &self.header,
            ty: self.message_type(),
            payload: &self.payload,
        }
        .serialize(serializer)
    }
}

impl Envelope {
    pub fn new(header: Header, payload: impl Into<Payload>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Canonical JSON form.
    pub fn encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn decode(value: &Value) -> Result<Self, EnvelopeError> {
        if !value.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        let raw = WireIn::deserialize(value).map_err(|_| EnvelopeError::NotAnObject)?;

        let header = raw.header.ok_or(EnvelopeError::Missing("header"))?;
        if !header.is_object() {
            return Err(EnvelopeError::InvalidHeader("expected an object".into()));
        }
        let header = Header::deserialize(&header)
            .map_err(|e| EnvelopeError::InvalidHeader(e.to_string()))?;

        let ty = raw.ty.ok_or(EnvelopeError::Missing("type"))?;
        let ty = MessageType::deserialize(&ty)
            .map_err(|_| EnvelopeError::UnknownType(ty.to_string()))?;

        let payload = raw.payload.ok_or(EnvelopeError::Missing("payload"))?;
        let payload =
            Payload::decode(ty, &payload).map_err(|source| EnvelopeError::Payload { ty, source })?;
        Ok(Self { header, payload })
    }
}

/// Malformed envelope: missing or ill-typed top-level field, unknown type, or payload shape mismatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: expected a JSON object")]
    NotAnObject,
    #[error("malformed envelope: missing `{0}`")]
    Missing(&'static str),
    #[error("malformed envelope: header: {0}")]
    InvalidHeader(String),
    /// Offending `type` value, rendered as JSON.
    #[error("malformed envelope: unknown type {0}")]
    UnknownType(String),
    #[error("malformed envelope: {ty} payload: {source}")]
    Payload {
        ty: MessageType,
        #[source]
        source: PayloadError,
    },
}
