//! Locally gathered ICE candidates, kept for the signaling endpoint.

use std::sync::{Arc, Mutex, PoisonError};

use crate::model::candidate::IceCandidate;

/// Append-only, insertion ordered candidate list. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct CandidateStore {
    inner: Arc<Mutex<Vec<IceCandidate>>>,
}

impl CandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, candidate: IceCandidate) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(candidate);
    }

    /// Copy of the candidates appended so far, oldest first.
    pub fn snapshot(&self) -> Vec<IceCandidate> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
