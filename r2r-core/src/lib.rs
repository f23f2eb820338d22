//! R2R robot-to-robot protocol reference implementation.
//! Envelope and payload types, newline-delimited JSON framing, task negotiation
//! state machine, and a tokio connection session driving handshake and dispatch.

pub mod config;
pub mod envelope;
pub mod negotiation;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod wire;

pub use config::{Role, SessionConfig};
pub use envelope::{Envelope, EnvelopeError, Header};
pub use negotiation::{
    NegotiationError, NegotiationState, Negotiator, Outcome, Resolution, SharedNegotiator,
    Transition,
};
pub use payload::{
    CommandPayload, GenericPayload, NegotiationAction, NegotiationPayload, Payload, PayloadError,
    StatusPayload, TelemetryPayload,
};
pub use protocol::{MessageType, PROTOCOL_VERSION};
pub use session::{Handler, Session, SessionError, SessionEvent, SessionHandle};
pub use wire::{
    decode_frame, encode_frame, encode_frame_with_limit, FrameCodec, FrameDecodeError,
    FrameEncodeError,
};
