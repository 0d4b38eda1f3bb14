//! vmlink-agent
//!
//! On-device agent that bridges an MQTT broker to a local VM host process.
//! Programs arrive over the broker, run in a supervised child, and the
//! child's output is relayed back out, tagged with a device-wide message
//! counter.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmlink_agent::config::{Config, DEFAULT_PORT};
use vmlink_agent::reactor::Agent;
use vmlink_agent::transport;

#[derive(Parser, Debug)]
#[command(name = "vmlink-agent")]
#[command(about = "MQTT-connected agent hosting a local VM for remote programs")]
struct Args {
    /// MQTT broker hostname
    #[arg(long, env = "VMLINK_HOST")]
    host: String,

    /// MQTT broker port
    #[arg(long, env = "VMLINK_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Device identifier, used as the topic root and MQTT client id
    #[arg(long, env = "VMLINK_DEVICE_ID")]
    device_id: String,

    /// CA certificate for verifying the broker (PEM)
    #[arg(long, env = "VMLINK_SERVER_CA")]
    server_ca: Option<PathBuf>,

    /// Client certificate for mutual TLS (PEM)
    #[arg(long, env = "VMLINK_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Client private key for mutual TLS (PEM)
    #[arg(long, env = "VMLINK_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// VM host executable spawned for each run
    #[arg(long, env = "VMLINK_VM_HOST", default_value = "vmlink-host")]
    vm_host: PathBuf,

    /// Where incoming programs are written for the VM host
    #[arg(long, env = "VMLINK_PROGRAM_PATH", default_value = "/tmp/vmlink-program.svm")]
    program_path: PathBuf,

    /// Peripheral telemetry source (FIFO or file of sensor lines)
    #[arg(long, env = "VMLINK_TELEMETRY")]
    telemetry_source: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Log to stderr; stdout stays clean for anything wrapping the agent.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::new(
        args.host,
        args.port,
        args.device_id,
        args.server_ca,
        args.client_cert,
        args.client_key,
        args.vm_host,
        args.program_path,
        args.telemetry_source,
    )
    .context("Invalid configuration")?;

    info!(
        host = %config.host,
        port = config.port,
        device_id = %config.device_id,
        tls = config.tls.is_some(),
        "Connecting to broker"
    );

    let (publisher, events) = transport::connect(&config).context("Broker setup")?;
    let mut agent = Agent::new(config, publisher);
    agent.run(events).await
}
