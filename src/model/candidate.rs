//! ICE candidates as exchanged with the browser
//!
//! The JSON shape follows `RTCIceCandidateInit`, so the client can hand these
//! straight to `addIceCandidate`.

use serde::{Deserialize, Serialize};
use str0m::Candidate;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The `candidate:` SDP attribute value. Empty means end of candidates.
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Wrap a locally gathered engine candidate.
    pub fn local(candidate: &Candidate, sdp_mid: Option<String>) -> Self {
        IceCandidate {
            candidate: candidate.to_sdp_string(),
            sdp_mid,
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }

    /// Parse into an engine candidate. Accepts the attribute with or without
    /// the leading `a=`.
    pub fn to_engine(&self) -> Result<Candidate, SessionError> {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);

        Candidate::from_sdp_string(line)
            .map_err(|e| SessionError::Negotiation(format!("bad ICE candidate '{line}': {e}")))
    }
}
