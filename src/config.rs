//! Agent configuration and topic naming.
//!
//! Every option can come from an environment variable or a command-line
//! flag, flag winning (clap handles the precedence). Topic names are
//! precomputed once at startup, rooted at the device id.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::transport::protocol::OutTopic;

/// Default MQTT-over-TLS port.
pub const DEFAULT_PORT: u16 = 8883;

/// Paths to the TLS material for mutual authentication with the broker.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub server_ca: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub tls: Option<TlsPaths>,

    /// VM host executable spawned for each run.
    pub vm_host: PathBuf,
    /// Where incoming programs are persisted for the VM host to read.
    pub program_path: PathBuf,
    /// Optional peripheral telemetry source (sensor FIFO or file).
    pub telemetry_source: Option<PathBuf>,

    pub topics: Topics,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: String,
        port: u16,
        device_id: String,
        server_ca: Option<PathBuf>,
        client_cert: Option<PathBuf>,
        client_key: Option<PathBuf>,
        vm_host: PathBuf,
        program_path: PathBuf,
        telemetry_source: Option<PathBuf>,
    ) -> Result<Self> {
        if device_id.is_empty() || device_id.contains('/') {
            bail!("Device id must be non-empty and must not contain '/'");
        }

        let tls = match (server_ca, client_cert, client_key) {
            (Some(server_ca), Some(client_cert), Some(client_key)) => {
                Some(TlsPaths { server_ca, client_cert, client_key })
            }
            (None, None, None) => None,
            _ => bail!(
                "TLS requires all of --server-ca, --client-cert and --client-key \
                 (or none, for a plaintext broker)"
            ),
        };

        let topics = Topics::new(&device_id);
        Ok(Self {
            host,
            port,
            device_id,
            tls,
            vm_host,
            program_path,
            telemetry_source,
            topics,
        })
    }
}

/// Inbound command classes, one per subscribed topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Run,
    Stop,
    Ping,
    Input,
}

/// Precomputed topic names rooted at the device id.
#[derive(Debug, Clone)]
pub struct Topics {
    pub hello: String,
    pub status: String,
    pub display: String,
    pub monitor: String,

    pub run: String,
    pub stop: String,
    pub ping: String,
    pub input: String,

    /// Byte offset of the leaf name within an inbound topic.
    leaf_index: usize,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        let topic = |leaf: &str| format!("{device_id}/{leaf}");
        Self {
            hello: topic("hello"),
            status: topic("status"),
            display: topic("display"),
            monitor: topic("monitor"),
            run: topic("run"),
            stop: topic("stop"),
            ping: topic("ping"),
            input: topic("input"),
            leaf_index: device_id.len() + 1,
        }
    }

    /// Topic name for an outbound message class.
    pub fn outbound(&self, topic: OutTopic) -> &str {
        match topic {
            OutTopic::Hello => &self.hello,
            OutTopic::Status => &self.status,
            OutTopic::Display => &self.display,
            OutTopic::Monitor => &self.monitor,
        }
    }

    /// Classify an inbound topic by the first character of its leaf name.
    ///
    /// The four subscribed leaves (run/stop/ping/input) are distinct in
    /// their first letter, so one byte after the `{device}/` prefix is
    /// enough to dispatch.
    pub fn classify(&self, topic: &str) -> Option<CommandKind> {
        match topic.as_bytes().get(self.leaf_index) {
            Some(b'r') => Some(CommandKind::Run),
            Some(b's') => Some(CommandKind::Stop),
            Some(b'p') => Some(CommandKind::Ping),
            Some(b'i') => Some(CommandKind::Input),
            _ => None,
        }
    }
}
