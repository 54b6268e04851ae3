//! Relay configuration
//!
//! Everything has a default, so the relay runs without a config file, but then
//! no transcoders are launched. `relay.example.toml` carries the full set of
//! pipelines. A TOML file can override any field:
//!
//! ```toml
//! http_addr = "0.0.0.0:3001"
//! media_host = "192.168.1.10"
//!
//! [[streams]]
//! port = 3002
//! resolution = "640x480"
//! command = "gst-launch-1.0 ... ! udpsink host={host} port={port}"
//! ```

use std::{
    collections::HashSet,
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::session::{Resolution, StreamDescriptor};

/// The transcoders are launched with these ports in their sink configuration.
pub const DEFAULT_RELAY_PORTS: [u16; 3] = [3002, 3003, 3004];

/// Payload type every relayed packet is rewritten to (VP8 in the default codec set).
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

pub const STREAM_COUNT: usize = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the signaling endpoints listen.
    pub http_addr: SocketAddr,
    /// Address for the WebRTC socket and its host candidate. When unset the
    /// first routable IPv4 interface is used.
    pub media_host: Option<IpAddr>,
    /// Address the relay channels bind their fixed ports on.
    pub relay_host: IpAddr,
    pub payload_type: u8,
    pub negotiation_timeout_ms: u64,
    /// Capacity of each track queue between a relay channel and the engine.
    pub track_queue: usize,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub port: u16,
    pub resolution: Resolution,
    /// Shell command producing RTP on `port`. Supports `{host}`, `{port}`,
    /// `{width}` and `{height}` placeholders.
    #[serde(default)]
    pub command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let resolutions = [
            Resolution::new(640, 480),
            Resolution::new(1280, 720),
            Resolution::new(1920, 1080),
        ];

        Config {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            media_host: None,
            relay_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            payload_type: DEFAULT_PAYLOAD_TYPE,
            negotiation_timeout_ms: 5000,
            track_queue: 512,
            streams: DEFAULT_RELAY_PORTS
                .iter()
                .zip(resolutions)
                .map(|(&port, resolution)| StreamConfig {
                    port,
                    resolution,
                    command: None,
                })
                .collect(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Config::from_toml(&text)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Config::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams.len() != STREAM_COUNT {
            bail!(
                "exactly {STREAM_COUNT} streams are relayed, {} configured",
                self.streams.len()
            );
        }

        let ports: HashSet<u16> = self.streams.iter().map(|s| s.port).collect();
        if ports.len() != self.streams.len() {
            bail!("stream ports must be distinct");
        }

        if self.payload_type > 127 {
            bail!("payload type {} is out of range", self.payload_type);
        }

        if self.track_queue == 0 {
            bail!("track_queue must be at least 1");
        }

        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn stream_descriptors(&self) -> Vec<StreamDescriptor> {
        self.streams
            .iter()
            .enumerate()
            .map(|(index, s)| StreamDescriptor {
                index,
                udp_port: s.port,
                resolution: s.resolution,
            })
            .collect()
    }
}
