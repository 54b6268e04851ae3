//! Session controller
//!
//! Owns the one negotiated peer connection. An offer starts a session: the
//! WebRTC socket and the three relay ports are bound, the transcoders are
//! launched and the engine driver is spawned to produce the answer. Teardown
//! releases all of it again.

pub mod candidates;
mod driver;
pub mod sdp;
pub mod signals;

use std::{
    net::IpAddr,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use serde::Serialize;
use str0m::change::SdpOffer;
use tokio::{
    net::UdpSocket,
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{timeout_at, Instant},
};
use tracing::{info, warn};

use crate::{
    config::Config,
    error::SessionError,
    model::{
        candidate::IceCandidate,
        event::SessionEvent,
        session::{SessionState, StreamDescriptor},
        tracks::{RelayStatsSnapshot, TrackOut},
    },
    pipeline::{PipelineHandle, PipelineLauncher},
    relay::RelayChannel,
    util::select_host_address,
};

use self::{
    candidates::CandidateStore,
    driver::{Command, Driver},
    signals::SessionSignals,
};

/// Everything a live session holds on to.
struct Session {
    commands: mpsc::Sender<Command>,
    driver: JoinHandle<()>,
    relays: Vec<RelayChannel>,
    pipelines: Vec<PipelineHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub port: u16,
    #[serde(flatten)]
    pub stats: RelayStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub streams: Vec<StreamDescriptor>,
    /// Empty while no session is live, or while an operation holds the session.
    pub relays: Vec<RelayStatus>,
}

pub struct SessionController {
    config: Config,
    media_host: IpAddr,
    streams: Vec<StreamDescriptor>,
    launcher: Arc<dyn PipelineLauncher>,
    signals: Arc<SessionSignals>,
    candidates: StdMutex<CandidateStore>,
    session: Mutex<Option<Session>>,
    #[cfg(test)]
    stall_answers: bool,
}

impl SessionController {
    pub fn new(config: Config, launcher: Arc<dyn PipelineLauncher>) -> anyhow::Result<Self> {
        config.validate()?;

        let media_host = match config.media_host {
            Some(ip) => ip,
            None => select_host_address()?,
        };

        Ok(SessionController {
            streams: config.stream_descriptors(),
            config,
            media_host,
            launcher,
            signals: Arc::new(SessionSignals::default()),
            candidates: StdMutex::new(CandidateStore::new()),
            session: Mutex::new(None),
            #[cfg(test)]
            stall_answers: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.signals.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.signals.subscribe()
    }

    /// Apply a remote offer and return the corrected answer SDP.
    pub async fn apply_remote_offer(&self, offer_sdp: &str) -> Result<String, SessionError> {
        let limit = self.config.negotiation_timeout();
        let deadline = Instant::now() + limit;

        let mut slot = timeout_at(deadline, self.session.lock())
            .await
            .map_err(|_| SessionError::NegotiationTimeout(limit))?;

        let state = self.signals.state();
        if !state.accepts_offer() {
            return Err(SessionError::StateConflict(state));
        }

        let offer = SdpOffer::from_sdp_string(offer_sdp)
            .map_err(|e| SessionError::Negotiation(format!("unparsable offer: {e}")))?;
        let first_mid = sdp::first_mid(offer_sdp);

        let media = sdp::media_count(offer_sdp);
        if media != self.streams.len() {
            warn!(
                "Offer has {} media lines for {} relayed streams",
                media,
                self.streams.len()
            );
        }

        let session = self.start_session().await?;

        let (reply, answer) = oneshot::channel();
        let sent = session
            .commands
            .send(Command::AcceptOffer {
                offer,
                first_mid,
                reply,
            })
            .await;
        *slot = Some(session);

        let result = match sent {
            Err(_) => Err(SessionError::EngineStopped),
            Ok(()) => match timeout_at(deadline, answer).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(SessionError::EngineStopped),
                Err(_) => Err(SessionError::NegotiationTimeout(limit)),
            },
        };

        match &result {
            Ok(_) => info!("Session answered, state {}", self.signals.state()),
            Err(e) => {
                warn!("Offer failed: {}", e);
                let _ = self.signals.transition(SessionState::Failed);
                self.teardown(&mut slot).await;
            }
        }

        result
    }

    /// Hand a trickled remote candidate to the engine.
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), SessionError> {
        let limit = self.config.negotiation_timeout();
        let deadline = Instant::now() + limit;

        let slot = timeout_at(deadline, self.session.lock())
            .await
            .map_err(|_| SessionError::NegotiationTimeout(limit))?;

        let Some(session) = slot.as_ref() else {
            return Err(SessionError::SessionNotReady);
        };

        if candidate.is_end_of_candidates() {
            return Ok(());
        }

        let candidate = candidate.to_engine()?;

        let (reply, done) = oneshot::channel();
        session
            .commands
            .send(Command::AddRemoteCandidate { candidate, reply })
            .await
            .map_err(|_| SessionError::EngineStopped)?;

        match timeout_at(deadline, done).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::EngineStopped),
            Err(_) => Err(SessionError::NegotiationTimeout(limit)),
        }
    }

    /// Locally gathered candidates of the current session. Never waits on
    /// a running negotiation.
    pub fn list_local_candidates(&self) -> Vec<IceCandidate> {
        self.candidates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Tear the session down. Safe to call in any state.
    pub async fn close(&self) -> SessionState {
        let mut slot = self.session.lock().await;
        self.teardown(&mut slot).await;
        self.signals.state()
    }

    pub fn status(&self) -> SessionStatus {
        let relays = match self.session.try_lock() {
            Ok(slot) => slot
                .as_ref()
                .map(|s| {
                    s.relays
                        .iter()
                        .map(|r| RelayStatus {
                            port: r.port(),
                            stats: r.stats(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => vec![],
        };

        SessionStatus {
            state: self.signals.state(),
            streams: self.streams.clone(),
            relays,
        }
    }

    async fn start_session(&self) -> Result<Session, SessionError> {
        let socket = UdpSocket::bind((self.media_host, 0))
            .await
            .map_err(|source| SessionError::Resource { port: 0, source })?;

        let candidates = CandidateStore::new();
        let driver = Driver::new(
            socket,
            candidates.clone(),
            self.signals.clone(),
            self.streams.len(),
        )?;
        #[cfg(test)]
        let driver = if self.stall_answers {
            driver.hold_answers()
        } else {
            driver
        };

        let (media_tx, media_rx) = mpsc::channel(self.config.track_queue);

        let mut relays = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            let track = TrackOut::new(stream.index, media_tx.clone());
            let started = RelayChannel::start(
                self.config.relay_host,
                stream.udp_port,
                track,
                self.config.payload_type,
            )
            .await;

            match started {
                Ok(relay) => relays.push(relay),
                Err(e) => {
                    for relay in relays {
                        relay.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        *self.candidates.lock().unwrap_or_else(PoisonError::into_inner) = candidates;

        let (commands, command_rx) = mpsc::channel(8);
        let driver = tokio::spawn(driver.run(command_rx, media_rx));

        // The relay ports are bound, so the transcoders' first packets land.
        let pipelines = self
            .streams
            .iter()
            .map(|stream| {
                self.launcher.start_stream(stream).unwrap_or_else(|e| {
                    warn!("Pipeline {} not started: {:?}", stream.index, e);
                    PipelineHandle::detached(stream.clone())
                })
            })
            .collect();

        Ok(Session {
            commands,
            driver,
            relays,
            pipelines,
        })
    }

    async fn teardown(&self, slot: &mut Option<Session>) {
        if let Some(session) = slot.take() {
            // Dropping the command sender ends the driver loop.
            drop(session.commands);
            if let Err(e) = session.driver.await {
                warn!("Session driver ended abnormally: {:?}", e);
            }

            for relay in session.relays {
                relay.stop().await;
            }

            for pipeline in session.pipelines {
                self.launcher.stop_stream(pipeline);
            }
        }

        *self.candidates.lock().unwrap_or_else(PoisonError::into_inner) = CandidateStore::new();

        let _ = self.signals.transition(SessionState::Closed);
        info!("Session closed");
    }
}
