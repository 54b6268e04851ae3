//! Transcoding pipeline launcher
//!
//! The transcoders run outside the relay. A session starts one per stream and
//! stops it at teardown; nothing supervises them in between, so a dead pipeline
//! looks the same as a silent camera.

use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{config::Config, model::session::StreamDescriptor};

/// A started (or skipped) pipeline for one stream.
#[derive(Debug)]
pub struct PipelineHandle {
    pub stream: StreamDescriptor,
    child: Option<Child>,
}

impl PipelineHandle {
    /// A stream with no process behind it.
    pub fn detached(stream: StreamDescriptor) -> Self {
        PipelineHandle {
            stream,
            child: None,
        }
    }
}

pub trait PipelineLauncher: Send + Sync {
    fn start_stream(&self, stream: &StreamDescriptor) -> Result<PipelineHandle>;

    fn stop_stream(&self, handle: PipelineHandle);
}

/// Runs each stream's configured command through `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    host: String,
    commands: Vec<Option<String>>,
}

impl CommandLauncher {
    pub fn new(config: &Config) -> Self {
        CommandLauncher {
            host: config.relay_host.to_string(),
            commands: config.streams.iter().map(|s| s.command.clone()).collect(),
        }
    }

    fn render(&self, template: &str, stream: &StreamDescriptor) -> String {
        template
            .replace("{host}", &self.host)
            .replace("{port}", &stream.udp_port.to_string())
            .replace("{width}", &stream.resolution.width.to_string())
            .replace("{height}", &stream.resolution.height.to_string())
    }
}

impl PipelineLauncher for CommandLauncher {
    fn start_stream(&self, stream: &StreamDescriptor) -> Result<PipelineHandle> {
        let Some(template) = self.commands.get(stream.index).and_then(Option::as_ref) else {
            return Ok(PipelineHandle::detached(stream.clone()));
        };

        let command = self.render(template, stream);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning pipeline for port {}", stream.udp_port))?;

        info!(
            "Pipeline {} ({}) -> port {} started as pid {}",
            stream.index,
            stream.resolution,
            stream.udp_port,
            child.id()
        );

        Ok(PipelineHandle {
            stream: stream.clone(),
            child: Some(child),
        })
    }

    fn stop_stream(&self, handle: PipelineHandle) {
        let Some(mut child) = handle.child else {
            return;
        };

        // Already exited is fine; kill only fails for reaped children.
        if let Err(e) = child.kill() {
            warn!("Pipeline {} kill failed: {:?}", handle.stream.index, e);
        }

        match child.wait() {
            Ok(status) => info!("Pipeline {} exited: {}", handle.stream.index, status),
            Err(e) => warn!("Pipeline {} wait failed: {:?}", handle.stream.index, e),
        }
    }
}
