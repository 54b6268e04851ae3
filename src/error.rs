//! Error types for the relay

use std::{io, time::Duration};

use crate::model::session::SessionState;

/// Errors surfaced by signaling operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The offer or candidate could not be parsed, or the engine rejected it.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// A fixed UDP port could not be bound.
    #[error("Could not bind UDP port {port}: {source}")]
    Resource {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The operation needs a negotiated session.
    #[error("No session has been negotiated yet")]
    SessionNotReady,

    /// An offer arrived while another session is active.
    #[error("A session is already active (state: {0})")]
    StateConflict(SessionState),

    /// The engine did not finish in time.
    #[error("Negotiation did not finish within {0:?}")]
    NegotiationTimeout(Duration),

    /// The engine driver stopped before replying.
    #[error("Session engine stopped")]
    EngineStopped,
}

impl SessionError {
    /// Short machine readable name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Negotiation(_) => "negotiation",
            SessionError::Resource { .. } => "resource",
            SessionError::SessionNotReady => "session_not_ready",
            SessionError::StateConflict(_) => "state_conflict",
            SessionError::NegotiationTimeout(_) => "negotiation_timeout",
            SessionError::EngineStopped => "engine_stopped",
        }
    }
}

/// An inbound datagram that is not a decodable RTP packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacket {
    #[error("Datagram of {0} bytes is shorter than an RTP header")]
    TooShort(usize),

    #[error("Unsupported RTP version {0}")]
    Version(u8),

    #[error("Datagram truncated in {0}")]
    Truncated(&'static str),

    #[error("Invalid padding length {0}")]
    Padding(usize),
}
