/*!
 * Transport adapters.
 *
 * The gateway talks to two things over one MQTT broker: the EW11 serial
 * bridge, which relays raw bus bytes on `<bridge>/recv` and `<bridge>/send`,
 * and Home Assistant. [`MessageLink`] is the broker connection;
 * [`Transport`] is the raw byte side built on top of it.
 */
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::Result;

/// A message on the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic
    pub topic: String,
    /// Payload
    pub payload: Bytes,
    /// Retain flag
    pub retain: bool,
}

impl Message {
    /// Non-retained message
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Mark the message retained
    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Payload as text, if it is UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Connection to a message broker
#[async_trait]
pub trait MessageLink: Send + Sync + fmt::Debug {
    /// Publish a message
    async fn publish(&self, message: Message) -> Result<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str) -> Result<()>;
}

/// Raw access to the wallpad bus
///
/// A call attempts the bytes once; delivery is not confirmed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Put bytes on the bus
    async fn send_raw(&self, bytes: Bytes) -> Result<()>;
}

/// Topics of the EW11 serial bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTopics {
    /// Bytes read from the bus
    pub recv: String,
    /// Bytes to write to the bus
    pub send: String,
}

impl BridgeTopics {
    /// Topics under a bridge prefix
    pub fn new(prefix: &str) -> Self {
        Self {
            recv: format!("{}/recv", prefix),
            send: format!("{}/send", prefix),
        }
    }
}

/// Bus transport through the EW11 bridge topics
#[derive(Debug, Clone)]
pub struct BridgeTransport {
    link: Arc<dyn MessageLink>,
    topics: BridgeTopics,
}

impl BridgeTransport {
    /// Create a transport on a broker link
    pub fn new(link: Arc<dyn MessageLink>, topics: BridgeTopics) -> Self {
        Self { link, topics }
    }

    /// Bridge topics in use
    pub fn topics(&self) -> &BridgeTopics {
        &self.topics
    }

    /// Subscribe to the receive topic
    pub async fn listen(&self) -> Result<()> {
        debug!(topic = %self.topics.recv, "Listening for bus traffic");
        self.link.subscribe(&self.topics.recv).await
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn send_raw(&self, bytes: Bytes) -> Result<()> {
        trace!(topic = %self.topics.send, len = bytes.len(), "Sending raw bytes");
        self.link.publish(Message::new(self.topics.send.clone(), bytes)).await
    }
}

#[cfg(feature = "mqtt")]
pub use self::mqtt::MqttLink;

#[cfg(feature = "mqtt")]
mod mqtt {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::error::TrySendError;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    use wallpad_core::config::MqttConfig;
    use wallpad_core::logging::MQTT_TARGET;

    use super::{Message, MessageLink};
    use crate::error::{Error, Result};

    const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    /// Hand an incoming message on without blocking; false once the receiver is gone
    pub(super) fn forward(tx: &mpsc::Sender<Message>, message: Message) -> bool {
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(topic = %message.topic, "Inbound queue full, message dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Broker link over rumqttc
    #[derive(Debug)]
    pub struct MqttLink {
        client: AsyncClient,
        subscriptions: Arc<Mutex<Vec<String>>>,
        task: Mutex<Option<JoinHandle<()>>>,
    }

    impl MqttLink {
        /// Connect to the broker; incoming publishes arrive on the returned receiver
        pub fn connect(config: &MqttConfig) -> (Self, mpsc::Receiver<Message>) {
            let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
            options.set_keep_alive(Duration::from_secs(30));
            if let (Some(username), Some(password)) = (&config.username, &config.password) {
                options.set_credentials(username, password);
            }

            let (client, mut event_loop) = AsyncClient::new(options, 10);
            let (tx, rx) = mpsc::channel(256);
            let subscriptions: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

            let resubscribe_client = client.clone();
            let resubscribe_topics = subscriptions.clone();
            let host = format!("{}:{}", config.host, config.port);
            let task = tokio::spawn(async move {
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let message = Message {
                                topic: publish.topic,
                                payload: publish.payload,
                                retain: publish.retain,
                            };
                            // The consumer publishes through this loop, so it must never wait on them
                            if !forward(&tx, message) {
                                debug!("Message receiver dropped, stopping MQTT loop");
                                break;
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to MQTT broker at {}", host);
                            let topics = match resubscribe_topics.lock() {
                                Ok(topics) => topics.clone(),
                                Err(_) => Vec::new(),
                            };
                            for topic in topics {
                                // The event loop is this task, so the request must not wait on it
                                if let Err(e) = resubscribe_client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                                    warn!("Failed to resubscribe to {}: {}", topic, e);
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("MQTT connection error: {}", e);
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
            });

            let link = Self {
                client,
                subscriptions,
                task: Mutex::new(Some(task)),
            };
            (link, rx)
        }

        /// Disconnect and stop the event loop
        pub async fn disconnect(&self) -> Result<()> {
            if let Err(e) = self.client.disconnect().await {
                warn!("MQTT disconnect failed: {}", e);
            }
            let task = self
                .task
                .lock()
                .map_err(|_| Error::transport("Failed to acquire MQTT task lock"))?
                .take();
            if let Some(task) = task {
                task.abort();
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessageLink for MqttLink {
        async fn publish(&self, message: Message) -> Result<()> {
            debug!(target: MQTT_TARGET, topic = %message.topic, payload = ?message.payload, "Publish");
            self.client
                .publish(message.topic, QoS::AtMostOnce, message.retain, message.payload.to_vec())
                .await
                .map_err(|e| Error::transport(format!("MQTT publish failed: {}", e)))
        }

        async fn subscribe(&self, topic: &str) -> Result<()> {
            {
                let mut subscriptions = self
                    .subscriptions
                    .lock()
                    .map_err(|_| Error::transport("Failed to acquire subscription lock"))?;
                if !subscriptions.iter().any(|t| t == topic) {
                    subscriptions.push(topic.to_string());
                }
            }
            self.client
                .subscribe(topic, QoS::AtMostOnce)
                .await
                .map_err(|e| Error::transport(format!("MQTT subscribe to {} failed: {}", topic, e)))
        }
    }
}

/// Link that keeps everything in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryLink {
    published: std::sync::Mutex<Vec<Message>>,
    subscriptions: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryLink {
    /// Messages published so far, draining them
    pub fn take_published(&self) -> Vec<Message> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }

    /// Topic filters subscribed so far
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl MessageLink for MemoryLink {
    async fn publish(&self, message: Message) -> Result<()> {
        trace!(topic = %message.topic, "Publish");
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}
