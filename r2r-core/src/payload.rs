//! Typed payload bodies, one per message type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::protocol::MessageType;

/// Payload does not have the shape its message type requires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid payload: {0}")]
pub struct PayloadError(pub String);

impl From<serde_json::Error> for PayloadError {
    fn from(e: serde_json::Error) -> Self {
        PayloadError(e.to_string())
    }
}

/// Body of a STATUS message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub details: Map<String, Value>,
}

impl StatusPayload {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Body of a COMMAND message: a named command with positional and keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub args: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub kwargs: Map<String, Value>,
}

impl CommandPayload {
    pub fn new(command_name: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Body of a TELEMETRY message: named sensor readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub data_points: Map<String, Value>,
}

impl TelemetryPayload {
    pub fn with_point(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data_points.insert(key.into(), value.into());
        self
    }
}

/// One step of a task negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationAction {
    Bid,
    ProposeTask,
    AcceptTask,
    RejectTask,
    CounterOffer,
}

impl NegotiationAction {
    pub const ALL: [NegotiationAction; 5] = [
        NegotiationAction::Bid,
        NegotiationAction::ProposeTask,
        NegotiationAction::AcceptTask,
        NegotiationAction::RejectTask,
        NegotiationAction::CounterOffer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationAction::Bid => "bid",
            NegotiationAction::ProposeTask => "propose_task",
            NegotiationAction::AcceptTask => "accept_task",
            NegotiationAction::RejectTask => "reject_task",
            NegotiationAction::CounterOffer => "counter_offer",
        }
    }

    /// Bid, proposal or counter-offer: an action that puts terms on the table.
    pub fn is_offer(self) -> bool {
        matches!(
            self,
            NegotiationAction::Bid | NegotiationAction::ProposeTask | NegotiationAction::CounterOffer
        )
    }

    /// Accept or reject: an action that resolves the task.
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationAction::AcceptTask | NegotiationAction::RejectTask)
    }
}

impl fmt::Display for NegotiationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NegotiationAction {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NegotiationAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| PayloadError(format!("unknown negotiation action {s:?}")))
    }
}

/// Body of a NEGOTIATION message, e.g. `{"task_id": "T002", "action": "bid", "details": {"cost": 28}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationPayload {
    pub task_id: String,
    pub action: NegotiationAction,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub details: Map<String, Value>,
}

impl NegotiationPayload {
    pub fn new(task_id: impl Into<String>, action: NegotiationAction) -> Self {
        Self {
            task_id: task_id.into(),
            action,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Unstructured body used by HANDSHAKE, HANDSHAKE_ACK, HEARTBEAT and ERROR. On the wire the payload object is the mapping itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenericPayload {
    pub data: Map<String, Value>,
}

impl GenericPayload {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Closed set of payloads. The variant determines the envelope's message type;
/// on the wire only the body is written, the type travels in the envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Handshake(GenericPayload),
    HandshakeAck(GenericPayload),
    Command(CommandPayload),
    Status(StatusPayload),
    Telemetry(TelemetryPayload),
    Error(GenericPayload),
    Heartbeat(GenericPayload),
    Negotiation(NegotiationPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Handshake(_) => MessageType::Handshake,
            Payload::HandshakeAck(_) => MessageType::HandshakeAck,
            Payload::Command(_) => MessageType::Command,
            Payload::Status(_) => MessageType::Status,
            Payload::Telemetry(_) => MessageType::Telemetry,
            Payload::Error(_) => MessageType::Error,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
            Payload::Negotiation(_) => MessageType::Negotiation,
        }
    }

    /// Decode `value` as the payload shape that `ty` requires.
    pub fn decode(ty: MessageType, value: &Value) -> Result<Self, PayloadError> {
        Ok(match ty {
            MessageType::Handshake => Payload::Handshake(GenericPayload::deserialize(value)?),
            MessageType::HandshakeAck => Payload::HandshakeAck(GenericPayload::deserialize(value)?),
            MessageType::Command => Payload::Command(CommandPayload::deserialize(value)?),
            MessageType::Status => Payload::Status(StatusPayload::deserialize(value)?),
            MessageType::Telemetry => Payload::Telemetry(TelemetryPayload::deserialize(value)?),
            MessageType::Error => Payload::Error(GenericPayload::deserialize(value)?),
            MessageType::Heartbeat => Payload::Heartbeat(GenericPayload::deserialize(value)?),
            MessageType::Negotiation => {
                Payload::Negotiation(NegotiationPayload::deserialize(value)?)
            }
        })
    }
}

impl From<StatusPayload> for Payload {
    fn from(p: StatusPayload) -> Self {
        Payload::Status(p)
    }
}

impl From<CommandPayload> for Payload {
    fn from(p: CommandPayload) -> Self {
        Payload::Command(p)
    }
}

impl From<TelemetryPayload> for Payload {
    fn from(p: TelemetryPayload) -> Self {
        Payload::Telemetry(p)
    }
}

impl From<NegotiationPayload> for Payload {
    fn from(p: NegotiationPayload) -> Self {
        Payload::Negotiation(p)
    }
}

// Absent or null becomes the empty value.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
