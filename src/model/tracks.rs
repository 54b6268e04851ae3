//! Outbound media tracks
//!
//! A relay channel owns one [`TrackOut`] and writes every decoded packet to it.
//! The track is the sending half of a queue drained by the session driver,
//! which maps the track index to the negotiated media line.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::model::rtp::RtpPacket;

/// A packet on its way from a relay channel into the engine.
#[derive(Debug)]
pub struct RelayedPacket {
    /// Index of the stream (and media line) the packet belongs to.
    pub track: usize,
    pub packet: RtpPacket,
    pub received: Instant,
    /// Counters of the channel that sent it, for drops on the session side.
    pub stats: Arc<RelayStats>,
}

/// Why a write to a track did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackWrite {
    Sent,
    /// The queue was full and the packet was dropped.
    Dropped,
    /// The session side is gone.
    Closed,
}

/// Sending side of one outbound media track.
#[derive(Debug, Clone)]
pub struct TrackOut {
    index: usize,
    tx: mpsc::Sender<RelayedPacket>,
    stats: Arc<RelayStats>,
}

impl TrackOut {
    pub fn new(index: usize, tx: mpsc::Sender<RelayedPacket>) -> Self {
        TrackOut {
            index,
            tx,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Queue a packet without waiting. UDP media has no use for backpressure,
    /// a full queue drops the packet.
    pub fn write_rtp(&self, packet: RtpPacket) -> TrackWrite {
        let relayed = RelayedPacket {
            track: self.index,
            packet,
            received: Instant::now(),
            stats: self.stats.clone(),
        };

        match self.tx.try_send(relayed) {
            Ok(()) => TrackWrite::Sent,
            Err(TrySendError::Full(_)) => TrackWrite::Dropped,
            Err(TrySendError::Closed(_)) => TrackWrite::Closed,
        }
    }
}

/// Per channel counters. `forwarded` counts packets handed to the session;
/// `unbound` counts those the session then dropped because their media line was
/// not negotiated yet.
#[derive(Debug, Default)]
pub struct RelayStats {
    forwarded: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    unbound: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub forwarded: u64,
    pub malformed: u64,
    pub dropped: u64,
    pub unbound: u64,
}

impl RelayStats {
    pub(crate) fn record(&self, write: TrackWrite) {
        let counter = match write {
            TrackWrite::Sent => &self.forwarded,
            TrackWrite::Dropped | TrackWrite::Closed => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unbound(&self) {
        self.unbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unbound: self.unbound.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rtp::{tests::datagram, RtpPacket};

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::parse(&datagram(96, seq, b"x")).unwrap()
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let track = TrackOut::new(2, tx);

        assert_eq!(track.write_rtp(packet(1)), TrackWrite::Sent);
        assert_eq!(track.write_rtp(packet(2)), TrackWrite::Dropped);

        let got = rx.try_recv().unwrap();
        assert_eq!(got.track, 2);
        assert_eq!(got.packet.header.sequence_number, 1);

        // The packet carries the track's own counters.
        got.stats.record_unbound();
        assert_eq!(track.stats().snapshot().unbound, 1);
    }

    #[test]
    fn closed_queue_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let track = TrackOut::new(0, tx);
        assert_eq!(track.write_rtp(packet(1)), TrackWrite::Closed);
    }

    #[test]
    fn stats_count_outcomes() {
        let stats = RelayStats::default();
        stats.record(TrackWrite::Sent);
        stats.record(TrackWrite::Sent);
        stats.record(TrackWrite::Dropped);
        stats.record_malformed();
        stats.record_unbound();

        assert_eq!(
            stats.snapshot(),
            RelayStatsSnapshot {
                forwarded: 2,
                malformed: 1,
                dropped: 1,
                unbound: 1,
            }
        );
    }
}
