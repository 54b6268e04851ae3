//! Engine driver
//!
//! One task owns the [`Rtc`] and the WebRTC socket for the lifetime of a
//! session. It polls the engine until it asks for a timeout, then waits for
//! whichever comes first: network input, a command from the controller, a
//! relayed packet, or the timeout itself.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use str0m::{
    change::SdpOffer,
    media::{MediaKind, Mid, Pt},
    net::{Protocol, Receive},
    rtp::{ExtensionValues, SeqNo, Ssrc},
    Candidate, Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time::sleep_until,
};
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    model::{
        candidate::IceCandidate, event::SessionEventKind, session::SessionState,
        tracks::RelayedPacket,
    },
    session::{candidates::CandidateStore, sdp, signals::SessionSignals},
};

pub(crate) enum Command {
    /// Apply the remote offer and reply with the corrected local answer.
    AcceptOffer {
        offer: SdpOffer,
        first_mid: Option<String>,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    AddRemoteCandidate {
        candidate: Candidate,
        reply: oneshot::Sender<()>,
    },
}

/// Extends 16 bit RTP sequence numbers across wraparound.
#[derive(Debug, Default)]
struct SeqExtender {
    highest: Option<u64>,
}

impl SeqExtender {
    fn extend(&mut self, seq: u16) -> u64 {
        let Some(highest) = self.highest else {
            self.highest = Some(seq as u64);
            return seq as u64;
        };

        let delta = seq.wrapping_sub(highest as u16) as i16 as i64;
        let extended = (highest as i64 + delta).max(0) as u64;

        if extended > highest {
            self.highest = Some(extended);
        }
        extended
    }
}

/// Negotiated media line a relay track writes to.
#[derive(Debug, Default)]
struct TrackBinding {
    mid: Option<Mid>,
    seq: SeqExtender,
}

pub(crate) struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    candidates: CandidateStore,
    signals: Arc<SessionSignals>,
    tracks: Vec<TrackBinding>,
    /// Offer replies kept back instead of sent, so negotiation never finishes.
    #[cfg(test)]
    held_answers: Option<Vec<oneshot::Sender<Result<String, SessionError>>>>,
}

impl Driver {
    pub fn new(
        socket: UdpSocket,
        candidates: CandidateStore,
        signals: Arc<SessionSignals>,
        track_count: usize,
    ) -> Result<Driver, SessionError> {
        let local_addr = socket
            .local_addr()
            .map_err(|source| SessionError::Resource { port: 0, source })?;

        let rtc = Rtc::builder().set_rtp_mode(true).build();

        Ok(Driver {
            rtc,
            socket,
            local_addr,
            candidates,
            signals,
            tracks: (0..track_count).map(|_| TrackBinding::default()).collect(),
            #[cfg(test)]
            held_answers: None,
        })
    }

    #[cfg(test)]
    pub fn hold_answers(mut self) -> Self {
        self.held_answers = Some(vec![]);
        self
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut media: mpsc::Receiver<RelayedPacket>,
    ) {
        let mut buf = vec![0; 2000];

        loop {
            let Some(timeout) = self.poll_until_timeout() else {
                break;
            };

            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => self.handle_datagram(&buf[..n], source),
                    Err(e) => debug!("WebRTC socket receive failed: {:?}", e),
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // The controller dropped the session.
                    None => break,
                },
                Some(relayed) = media.recv() => self.write_media(relayed),
                _ = sleep_until(timeout.into()) => {}
            }

            // Drive time forward.
            self.handle_input(Input::Timeout(Instant::now()));
        }

        if self.rtc.is_alive() {
            self.rtc.disconnect();
        } else if self.signals.state() != SessionState::Closed {
            let _ = self.signals.transition(SessionState::Failed);
        }

        self.signals.emit(SessionEventKind::signaling("closed"));
        self.signals.emit(SessionEventKind::connection("closed"));
        info!("Session driver on {} stopped", self.local_addr);
    }

    /// Poll all output from the engine until it returns a timeout. `None`
    /// once the engine is no longer alive.
    fn poll_until_timeout(&mut self) -> Option<Instant> {
        loop {
            if !self.rtc.is_alive() {
                return None;
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return Some(t),
                Ok(Output::Transmit(t)) => {
                    if let Err(e) = self.socket.try_send_to(&t.contents, t.destination) {
                        debug!("Dropped transmit to {}: {:?}", t.destination, e);
                    }
                }
                Ok(Output::Event(e)) => self.handle_event(e),
                Err(e) => {
                    warn!("Engine poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                    return None;
                }
            }
        }
    }

    fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Engine rejected input, disconnecting: {:?}", e);
            self.rtc.disconnect();
        }
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        // Preparse to figure out the multiplexing of protocols on one port.
        let Ok(contents) = data.try_into() else {
            debug!("Unrecognised datagram from {}", source);
            return;
        };

        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local_addr,
                contents,
            },
        );

        if self.rtc.accepts(&input) {
            self.handle_input(input);
        } else {
            debug!("Engine does not accept input from {}", source);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AcceptOffer {
                offer,
                first_mid,
                reply,
            } => {
                let result = self.accept_offer(offer, first_mid);
                if result.is_err() {
                    let _ = self.signals.transition(SessionState::Failed);
                }
                #[cfg(test)]
                if let Some(held) = &mut self.held_answers {
                    held.push(reply);
                    return;
                }
                // The controller may have given up waiting.
                let _ = reply.send(result);
            }
            Command::AddRemoteCandidate { candidate, reply } => {
                debug!("Remote candidate {}", candidate.to_sdp_string());
                self.rtc.add_remote_candidate(candidate);
                if self.signals.state() == SessionState::AnswerSent {
                    let _ = self.signals.transition(SessionState::IceExchanging);
                }
                let _ = reply.send(());
            }
        }
    }

    fn accept_offer(
        &mut self,
        offer: SdpOffer,
        first_mid: Option<String>,
    ) -> Result<String, SessionError> {
        self.gather_local_candidates(first_mid)?;

        // str0m applies the remote offer and our answer as one step.
        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| SessionError::Negotiation(format!("offer rejected: {e}")))?;

        self.signals.emit(SessionEventKind::signaling("have-remote-offer"));
        self.signals
            .transition(SessionState::RemoteOfferApplied)
            .map_err(SessionError::StateConflict)?;

        let sdp = sdp::ensure_bundle_group(&answer.to_sdp_string());

        self.signals.emit(SessionEventKind::signaling("stable"));
        self.signals
            .transition(SessionState::AnswerSent)
            .map_err(SessionError::StateConflict)?;

        Ok(sdp)
    }

    /// The socket's own address is the only candidate; it is added before the
    /// answer is created so the answer carries it too.
    fn gather_local_candidates(&mut self, sdp_mid: Option<String>) -> Result<(), SessionError> {
        self.signals.emit(SessionEventKind::gathering("gathering"));

        let candidate = Candidate::host(self.local_addr, "udp")
            .map_err(|e| SessionError::Negotiation(format!("host candidate: {e}")))?;

        if self.rtc.add_local_candidate(candidate.clone()).is_some() {
            let local = IceCandidate::local(&candidate, sdp_mid);
            info!("Local candidate {}", local.candidate);
            self.candidates.append(local.clone());
            self.signals
                .emit(SessionEventKind::LocalCandidate { candidate: local });
        } else {
            warn!("Engine refused local candidate {}", self.local_addr);
        }

        self.signals.emit(SessionEventKind::gathering("complete"));
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected => {
                info!("Peer connection established");
                self.signals.emit(SessionEventKind::connection("connected"));
            }
            Event::IceConnectionStateChange(state) => {
                info!("ICE connection state: {:?}", state);
                self.signals.emit(SessionEventKind::IceConnectionState {
                    state: format!("{state:?}").to_lowercase(),
                });
                self.handle_ice_state(state);
            }
            Event::MediaAdded(added) => self.bind_track(added.mid, added.kind),
            other => debug!("Engine event: {:?}", other),
        }
    }

    fn handle_ice_state(&mut self, state: IceConnectionState) {
        match state {
            IceConnectionState::New => {}
            IceConnectionState::Checking => {
                self.signals.emit(SessionEventKind::connection("connecting"));
                if self.signals.state() == SessionState::AnswerSent {
                    let _ = self.signals.transition(SessionState::IceExchanging);
                }
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if self.signals.state() == SessionState::AnswerSent {
                    let _ = self.signals.transition(SessionState::IceExchanging);
                }
                let _ = self.signals.transition(SessionState::Connected);
            }
            IceConnectionState::Disconnected => {
                // No ICE restart, a lost connection ends the session.
                self.signals.emit(SessionEventKind::connection("failed"));
                let _ = self.signals.transition(SessionState::Failed);
                self.rtc.disconnect();
            }
        }
    }

    /// Media lines are handed to relay tracks in the order the offer lists them.
    fn bind_track(&mut self, mid: Mid, kind: MediaKind) {
        if kind != MediaKind::Video {
            debug!("Ignoring {:?} media line {}", kind, mid);
            return;
        }

        let Some((index, binding)) = self
            .tracks
            .iter_mut()
            .enumerate()
            .find(|(_, t)| t.mid.is_none())
        else {
            debug!("No relay track left for media line {}", mid);
            return;
        };

        binding.mid = Some(mid);
        info!("Track {} bound to media line {}", index, mid);
        self.signals.emit(SessionEventKind::TrackBound {
            track: index,
            mid: mid.to_string(),
        });
    }

    fn write_media(&mut self, relayed: RelayedPacket) {
        let Some(binding) = self.tracks.get_mut(relayed.track) else {
            return;
        };
        let Some(mid) = binding.mid else {
            // Not negotiated yet.
            relayed.stats.record_unbound();
            return;
        };

        let header = &relayed.packet.header;
        let seq_no: SeqNo = binding.seq.extend(header.sequence_number).into();

        let mut api = self.rtc.direct_api();
        if api.stream_tx_by_mid(mid, None).is_none() {
            // Send streams are keyed by SSRC, and transcoders may pick the same one.
            let mut ssrc = Ssrc::from(header.ssrc);
            if api.stream_tx(&ssrc).is_some() {
                ssrc = api.new_ssrc();
            }
            debug!("Track {} sends as SSRC {} on media line {}", relayed.track, ssrc, mid);
            api.declare_stream_tx(ssrc, None, mid, None);
        }
        let Some(stream) = api.stream_tx_by_mid(mid, None) else {
            return;
        };

        if let Err(e) = stream.write_rtp(
            Pt::from(header.payload_type),
            seq_no,
            header.timestamp,
            relayed.received,
            header.marker,
            ExtensionValues::default(),
            true,
            relayed.packet.payload.to_vec(),
        ) {
            warn!("Track {} write failed: {:?}", relayed.track, e);
        }
    }
}
