//! MQTT transport for agent ↔ broker communication.
//!
//! Provides the `Publisher` trait the rest of the agent publishes through,
//! and the rumqttc wiring: connection options (including mutual TLS),
//! subscription on connect, and the event stream the reactor polls. The
//! MQTT protocol engine itself is rumqttc's concern — the agent only
//! depends on publishing byte payloads to named topics and receiving
//! payloads from subscribed ones.

pub mod protocol;

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration};
use tracing::{debug, info, trace};

use crate::config::Config;

/// Outstanding-request capacity of the client → event loop channel.
/// `try_publish` fails (fatally) if the engine ever falls this far behind.
const REQUEST_CAPACITY: usize = 64;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Sink for encoded outbound messages.
///
/// Implementations must not block: the reactor publishes from inside event
/// handlers.
pub trait Publisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// `Publisher` backed by the rumqttc client. QoS 1: the broker side expects
/// at-least-once delivery, dedup happens at the subscriber.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("MQTT publish to {topic} failed"))
    }
}

/// The inbound half: owns the protocol engine and yields application
/// messages. Connection housekeeping (pings, retransmits, subscription on
/// connect) happens inside `next_publish`.
pub struct MqttEvents {
    client: AsyncClient,
    eventloop: EventLoop,
    subscriptions: Vec<String>,
}

impl MqttEvents {
    /// Drive the protocol engine until the next application message.
    ///
    /// Transport-level errors are fatal by design: the agent has no state
    /// worth preserving and a supervisor restarts it.
    pub async fn next_publish(&mut self) -> Result<(String, Vec<u8>)> {
        loop {
            match self.eventloop.poll().await.context("MQTT connection")? {
                Event::Incoming(Packet::ConnAck(_)) => {
                    info!("Connected to broker, subscribing");
                    for topic in &self.subscriptions {
                        self.client
                            .try_subscribe(topic.clone(), QoS::AtLeastOnce)
                            .with_context(|| format!("subscribe to {topic}"))?;
                    }
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    debug!(topic = %publish.topic, len = publish.payload.len(), "Inbound message");
                    return Ok((publish.topic, publish.payload.to_vec()));
                }
                other => trace!(?other, "MQTT event"),
            }
        }
    }
}

/// Build the MQTT client from the agent configuration.
pub fn connect(config: &Config) -> Result<(MqttPublisher, MqttEvents)> {
    let mut options = MqttOptions::new(&config.device_id, &config.host, config.port);
    options.set_keep_alive(KEEP_ALIVE);

    if let Some(tls) = &config.tls {
        let read = |path: &std::path::Path| {
            std::fs::read(path).with_context(|| format!("read TLS material {}", path.display()))
        };
        options.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Simple {
            ca: read(&tls.server_ca)?,
            alpn: None,
            client_auth: Some((read(&tls.client_cert)?, read(&tls.client_key)?)),
        }));
    }

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let topics = &config.topics;
    let subscriptions = vec![
        topics.run.clone(),
        topics.stop.clone(),
        topics.ping.clone(),
        topics.input.clone(),
    ];

    Ok((
        MqttPublisher { client: client.clone() },
        MqttEvents { client, eventloop, subscriptions },
    ))
}
