//! Session state and event fan-out shared by the controller and its driver.

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::model::{
    event::{SessionEvent, SessionEventKind},
    session::SessionState,
};

const EVENT_BACKLOG: usize = 64;

#[derive(Debug)]
pub struct SessionSignals {
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionSignals {
    fn default() -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        SessionSignals { state, events }
    }
}

impl SessionSignals {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, kind: SessionEventKind) {
        // No subscribers is fine, events are observational.
        let _ = self.events.send(SessionEvent::now(kind));
    }

    /// Move to `to` if the state machine allows it. Returns the state that
    /// refused the move otherwise. Moving to the current state is a no-op.
    pub fn transition(&self, to: SessionState) -> Result<(), SessionState> {
        let mut from = None;
        let mut refused = None;

        self.state.send_if_modified(|current| {
            if *current == to {
                return false;
            }
            if !current.can_become(to) {
                refused = Some(*current);
                return false;
            }
            from = Some(*current);
            *current = to;
            true
        });

        if let Some(state) = refused {
            debug!("Session refused {} -> {}", state, to);
            return Err(state);
        }

        if let Some(from) = from {
            self.emit(SessionEventKind::StateChanged { from, to });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_emit_events() {
        let signals = SessionSignals::default();
        let mut events = signals.subscribe();

        signals.transition(SessionState::RemoteOfferApplied).unwrap();
        assert_eq!(signals.state(), SessionState::RemoteOfferApplied);

        let e = events.try_recv().unwrap();
        assert_eq!(
            e.kind,
            SessionEventKind::StateChanged {
                from: SessionState::Created,
                to: SessionState::RemoteOfferApplied,
            }
        );
    }

    #[test]
    fn refused_transition_keeps_state() {
        let signals = SessionSignals::default();
        let mut events = signals.subscribe();

        assert_eq!(
            signals.transition(SessionState::Connected),
            Err(SessionState::Created)
        );
        assert_eq!(signals.state(), SessionState::Created);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn same_state_is_silent() {
        let signals = SessionSignals::default();
        let mut events = signals.subscribe();

        signals.transition(SessionState::Created).unwrap();
        assert!(events.try_recv().is_err());
    }
}
