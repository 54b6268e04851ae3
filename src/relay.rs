//! UDP to track relay
//!
//! Each [`RelayChannel`] listens on one fixed port for RTP from a transcoder,
//! forces the payload type to the negotiated value and writes the packet to its
//! outbound track. Packets go out in the order the socket delivers them.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use tokio::{net::UdpSocket, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    model::{
        rtp::RtpPacket,
        tracks::{RelayStats, RelayStatsSnapshot, TrackOut, TrackWrite},
    },
};

/// Largest datagram we accept, comfortably above any RTP over Ethernet MTU.
const MAX_DATAGRAM: usize = 2000;

#[derive(Debug)]
pub struct RelayChannel {
    addr: SocketAddr,
    stats: Arc<RelayStats>,
    task: JoinHandle<()>,
}

impl RelayChannel {
    /// Bind `host:port` and start forwarding into `track`.
    ///
    /// The port is never reassigned: if it is taken the channel fails with
    /// [`SessionError::Resource`].
    pub async fn start(
        host: IpAddr,
        port: u16,
        track: TrackOut,
        payload_type: u8,
    ) -> Result<RelayChannel, SessionError> {
        let socket = UdpSocket::bind(SocketAddr::new(host, port))
            .await
            .map_err(|source| SessionError::Resource { port, source })?;
        let addr = socket
            .local_addr()
            .map_err(|source| SessionError::Resource { port, source })?;

        info!("Relay {} bound for track {}", addr, track.index());

        let stats = track.stats();
        let task = tokio::spawn(relay_loop(socket, track, payload_type, stats.clone()));

        Ok(RelayChannel { addr, stats, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the receive loop. The socket is closed once this returns.
    pub async fn stop(self) {
        self.task.abort();
        // The loop only ends by abort or a closed track, the join result carries nothing.
        let _ = self.task.await;
        info!("Relay {} stopped", self.addr);
    }
}

async fn relay_loop(socket: UdpSocket, track: TrackOut, payload_type: u8, stats: Arc<RelayStats>) {
    let mut buf = vec![0; MAX_DATAGRAM];

    loop {
        let n = match socket.recv_from(&mut buf).await {
            Ok((n, _source)) => n,
            Err(e) => {
                // ICMP errors surface here on some platforms; the socket stays usable.
                warn!("Relay track {} receive failed: {:?}", track.index(), e);
                continue;
            }
        };

        let mut packet = match RtpPacket::parse(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                stats.record_malformed();
                debug!("Relay track {} dropped datagram: {}", track.index(), e);
                continue;
            }
        };

        packet.header.payload_type = payload_type;

        let written = track.write_rtp(packet);
        stats.record(written);

        match written {
            TrackWrite::Sent => {}
            TrackWrite::Dropped => debug!("Relay track {} queue full", track.index()),
            TrackWrite::Closed => {
                info!("Relay track {} has no session, stopping", track.index());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::model::{rtp::tests::datagram, tracks::RelayedPacket};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn started(track: usize) -> (RelayChannel, mpsc::Receiver<RelayedPacket>) {
        let (tx, rx) = mpsc::channel(64);
        let relay = RelayChannel::start(LOCALHOST, 0, TrackOut::new(track, tx), 96)
            .await
            .unwrap();
        (relay, rx)
    }

    async fn sender() -> UdpSocket {
        UdpSocket::bind((LOCALHOST, 0)).await.unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<RelayedPacket>) -> RelayedPacket {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("packet within deadline")
            .expect("track open")
    }

    #[tokio::test]
    async fn overrides_payload_type() {
        let (relay, mut rx) = started(1).await;
        let tx = sender().await;
        let dest = (LOCALHOST, relay.port());

        for pt in [0, 100, 127] {
            tx.send_to(&datagram(pt, 7, b"data"), dest).await.unwrap();
            let got = next(&mut rx).await;
            assert_eq!(got.track, 1);
            assert_eq!(got.packet.header.payload_type, 96);
            assert_eq!(&got.packet.payload[..], b"data");
        }

        relay.stop().await;
    }

    #[tokio::test]
    async fn preserves_arrival_order() {
        let (relay, mut rx) = started(0).await;
        let tx = sender().await;
        let dest = (LOCALHOST, relay.port());

        for seq in [10u16, 11, 12] {
            tx.send_to(&datagram(96, seq, b"x"), dest).await.unwrap();
        }

        let mut seen = vec![];
        for _ in 0..3 {
            seen.push(next(&mut rx).await.packet.header.sequence_number);
        }
        assert_eq!(seen, [10, 11, 12]);

        relay.stop().await;
    }

    #[tokio::test]
    async fn survives_malformed_datagrams() {
        let (relay, mut rx) = started(2).await;
        let tx = sender().await;
        let dest = (LOCALHOST, relay.port());

        let valid = datagram(111, 99, b"after");
        tx.send_to(&valid[..5], dest).await.unwrap();
        tx.send_to(&[0x40; 20], dest).await.unwrap();
        tx.send_to(&valid, dest).await.unwrap();

        let got = next(&mut rx).await;
        assert_eq!(got.packet.header.sequence_number, 99);
        assert_eq!(got.packet.header.payload_type, 96);

        let stats = relay.stats();
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.forwarded, 1);

        relay.stop().await;
    }

    #[tokio::test]
    async fn taken_port_is_a_resource_error() {
        let (relay, _rx) = started(0).await;
        let (tx, _rx2) = mpsc::channel(1);

        let err = RelayChannel::start(LOCALHOST, relay.port(), TrackOut::new(0, tx), 96)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Resource { port, .. } if port == relay.port()));

        relay.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_the_port() {
        let (relay, _rx) = started(0).await;
        let port = relay.port();
        relay.stop().await;

        let rebound = UdpSocket::bind((LOCALHOST, port)).await;
        assert!(rebound.is_ok());
    }
}
