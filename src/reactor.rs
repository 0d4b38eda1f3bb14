//! The agent's event loop.
//!
//! Single-threaded, cooperative: one `select!` multiplexes the MQTT event
//! stream, the running child's IPC/exit events, and a one-second tick for
//! telemetry. Handlers run to completion before the next event is
//! dispatched, so the session state needs no locking. Recoverable problems
//! (duplicates, malformed messages, run-while-running) are handled locally;
//! everything else propagates out as fatal.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::{CommandKind, Config};
use crate::session::Session;
use crate::supervisor::{describe_exit, ChildEvent, VmChild};
use crate::telemetry::TelemetryPoller;
use crate::transport::protocol::{decode_ipc, parse_inbound, Outbound};
use crate::transport::{MqttEvents, Publisher};

/// Multiplexer tick: telemetry polling and liveness when nothing else
/// happens.
const TICK: Duration = Duration::from_secs(1);

/// Top-level agent state, owned by the reactor task.
pub struct Agent<P: Publisher> {
    config: Config,
    publisher: P,
    session: Session,
    telemetry: TelemetryPoller,
    running: Option<VmChild>,
}

impl<P: Publisher> Agent<P> {
    pub fn new(config: Config, publisher: P) -> Self {
        let telemetry = TelemetryPoller::open(config.telemetry_source.as_deref());
        Self {
            config,
            publisher,
            session: Session::new(),
            telemetry,
            running: None,
        }
    }

    /// Run forever (or until a fatal error).
    pub async fn run(&mut self, mut events: MqttEvents) -> Result<()> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = events.next_publish() => {
                    let (topic, payload) = incoming?;
                    self.handle_incoming(&topic, &payload).await?;
                }
                event = child_event(&mut self.running) => {
                    self.handle_child_event(event?)?;
                }
                _ = tick.tick() => {
                    self.telemetry_pass()?;
                }
            }
        }
    }

    fn publish_all(&self, batch: Vec<Outbound>) -> Result<()> {
        for msg in batch {
            self.publisher
                .publish(self.config.topics.outbound(msg.topic), msg.payload)?;
        }
        Ok(())
    }

    /// Dispatch one inbound broker message: dedup first, then dispatch on
    /// the topic's leaf initial.
    pub async fn handle_incoming(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let Some(kind) = self.config.topics.classify(topic) else {
            debug!(topic, "Ignoring message on unrecognized topic");
            return Ok(());
        };
        let (id, rest) = match parse_inbound(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed inbound message");
                return Ok(());
            }
        };
        if !self.session.accept_inbound(id) {
            return Ok(());
        }

        match kind {
            CommandKind::Run => self.handle_run(rest).await,
            CommandKind::Stop => self.handle_stop(),
            CommandKind::Ping => {
                let batch = self.session.status_refresh();
                self.publish_all(batch)
            }
            CommandKind::Input => {
                match &self.running {
                    Some(child) => child.send_input(rest),
                    None => debug!("Input received while idle, ignoring"),
                }
                Ok(())
            }
        }
    }

    async fn handle_run(&mut self, program: &[u8]) -> Result<()> {
        if !self.session.is_idle() {
            // Not an error: re-emit status so the requester can resync.
            debug!("Run requested while already running");
            let batch = self.session.status_refresh();
            return self.publish_all(batch);
        }

        let child = VmChild::spawn(&self.config, program).await?;
        info!(pid = child.pid(), "Program accepted, VM host running");
        self.running = Some(child);
        let batch = self.session.set_running();
        self.publish_all(batch)
    }

    fn handle_stop(&mut self) -> Result<()> {
        match &self.running {
            Some(child) => {
                info!(pid = child.pid(), "Stop requested, signalling VM host");
                child.terminate();
                // Idle is reported only once the exit is observed.
            }
            None => debug!("Stop received while idle"),
        }
        let batch = self.session.status_refresh();
        self.publish_all(batch)
    }

    /// React to output or exit from the running child.
    pub fn handle_child_event(&mut self, event: ChildEvent) -> Result<()> {
        match event {
            ChildEvent::Display(bytes) => self.relay_display(&bytes),
            ChildEvent::Exited(status) => {
                info!(outcome = %describe_exit(status), "VM host exited");
                let Some(mut child) = self.running.take() else {
                    return Ok(());
                };
                // The terminal result may still sit in the channel; relay
                // everything before tearing it down.
                for bytes in child.drain()? {
                    self.relay_display(&bytes)?;
                }
                let batch = self.session.set_idle();
                self.publish_all(batch)
            }
        }
    }

    fn relay_display(&mut self, bytes: &[u8]) -> Result<()> {
        match decode_ipc(bytes) {
            Ok(msg) => {
                let batch = self.session.relay_ipc(msg);
                self.publish_all(batch)
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed IPC message");
                Ok(())
            }
        }
    }

    /// One bounded best-effort telemetry pass.
    pub fn telemetry_pass(&mut self) -> Result<()> {
        for line in self.telemetry.poll() {
            let batch = self.session.monitor_line(&line);
            self.publish_all(batch)?;
        }
        Ok(())
    }
}

/// Child event source: pending while no child runs, so the select arm
/// simply never fires between runs.
async fn child_event(running: &mut Option<VmChild>) -> Result<ChildEvent> {
    match running.as_mut() {
        Some(child) => child.next_event().await,
        None => std::future::pending().await,
    }
}
