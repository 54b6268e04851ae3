//! Observable session events
//!
//! The controller publishes these on a broadcast channel. They describe what
//! happened; nothing in the negotiation path reads them back.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{candidate::IceCandidate, session::SessionState};

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn now(kind: SessionEventKind) -> Self {
        SessionEvent {
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// The controller's state machine moved.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Peer connection state: `new`, `connecting`, `connected`, `closed`.
    ConnectionState { state: String },
    /// ICE connection state as reported by the engine.
    IceConnectionState { state: String },
    /// Local candidate gathering: `gathering`, `complete`.
    IceGatheringState { state: String },
    /// Offer/answer progress: `have-remote-offer`, `stable`, `closed`.
    SignalingState { state: String },
    /// A local candidate was gathered and stored.
    LocalCandidate { candidate: IceCandidate },
    /// A negotiated media line was bound to a relay track.
    TrackBound { track: usize, mid: String },
}

impl SessionEventKind {
    pub(crate) fn connection(state: &str) -> Self {
        SessionEventKind::ConnectionState {
            state: state.to_string(),
        }
    }

    pub(crate) fn gathering(state: &str) -> Self {
        SessionEventKind::IceGatheringState {
            state: state.to_string(),
        }
    }

    pub(crate) fn signaling(state: &str) -> Self {
        SessionEventKind::SignalingState {
            state: state.to_string(),
        }
    }
}
