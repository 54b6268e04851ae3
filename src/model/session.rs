//! Session state and stream descriptors
//!
//! A session is the one negotiated peer connection the relay serves at a time.
//! Its state only moves along the transitions allowed by [`SessionState::can_become`].

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Lifecycle of the single relayed peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No offer has been accepted yet.
    Created,
    /// The remote offer was handed to the engine.
    RemoteOfferApplied,
    /// The corrected answer has been returned to the client.
    AnswerSent,
    /// Connectivity checks are running, candidates are being exchanged.
    IceExchanging,
    /// ICE reports a working candidate pair.
    Connected,
    /// Negotiation or transport failed. Only teardown leaves this state.
    Failed,
    /// Torn down explicitly. A new offer may start over from here.
    Closed,
}

impl SessionState {
    /// Whether a new offer may be applied in this state.
    pub fn accepts_offer(self) -> bool {
        matches!(self, SessionState::Created | SessionState::Closed)
    }

    pub fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (_, Closed) => true,
            (Closed, Failed) => false,
            (_, Failed) => true,
            (Created | Closed, RemoteOfferApplied) => true,
            (RemoteOfferApplied, AnswerSent) => true,
            (AnswerSent, IceExchanging) => true,
            (IceExchanging, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::RemoteOfferApplied => "remote_offer_applied",
            SessionState::AnswerSent => "answer_sent",
            SessionState::IceExchanging => "ice_exchanging",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Output size of one transcoding pipeline, written as `WxH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("resolution '{s}' is not in WxH form"))?;

        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("bad width in resolution '{s}'"))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("bad height in resolution '{s}'"))?;

        if width == 0 || height == 0 {
            return Err(format!("resolution '{s}' has a zero dimension"));
        }

        Ok(Resolution { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// One of the three relayed media streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescriptor {
    /// Position of the stream, which is also the position of its media line.
    pub index: usize,
    /// Fixed UDP port the transcoder sends to.
    pub udp_port: u16,
    pub resolution: Resolution,
}
