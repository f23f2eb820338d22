//! Session tunables. The agent binary fills these from its config file and environment.

use std::time::Duration;

use crate::protocol::PROTOCOL_VERSION;
use crate::wire::MAX_FRAME_LEN;

/// Default time allowed for the handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of consecutive undecodable frames tolerated before the session fails.
pub const DEFAULT_MAX_FRAME_ERRORS: u32 = 8;

const DEFAULT_READ_BUFFER: usize = 4096;

/// Which side opens the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends HANDSHAKE and waits for HANDSHAKE_ACK.
    Initiator,
    /// Waits for HANDSHAKE and answers with HANDSHAKE_ACK (or ERROR on version mismatch).
    Acceptor,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `source_id` of every envelope this session sends.
    pub agent_id: String,
    pub role: Role,
    /// Version announced in headers and the handshake.
    pub version: String,
    pub handshake_timeout: Duration,
    /// Cap on a single frame and on undelimited buffered input.
    pub max_frame_len: usize,
    /// Consecutive decode failures tolerated; one more closes the session.
    pub max_frame_errors: u32,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
}

impl SessionConfig {
    pub fn new(agent_id: impl Into<String>, role: Role) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            version: PROTOCOL_VERSION.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
            max_frame_errors: DEFAULT_MAX_FRAME_ERRORS,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}
