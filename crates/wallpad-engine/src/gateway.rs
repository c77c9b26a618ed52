/*!
 * The running gateway.
 *
 * Ties the broker link, the command scheduler, the Home Assistant bridge and
 * the diagnostics log together. Four background tasks run while the gateway
 * is started: the inbound message router, the outbound frame sender, the
 * scheduler tick and the bus silence watchdog.
 */
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn, Instrument};

use wallpad_core::config::{GatewayConfig, SharedConfig};
use wallpad_core::event::SharedEventBus;
use wallpad_core::logging::{component_span, operation_span, BUS_TARGET};
use wallpad_core::types::now;
use wallpad_protocol::{
    Codec, CodecOptions, Decoded, DeviceScan, FoundDevices, Packet, PacketText, SharedRegistry,
};

use crate::bridge::HaBridge;
use crate::diagnostics::{DiagnosticsLog, DiagnosticsSink, Direction};
use crate::error::Result;
use crate::scheduler::CommandScheduler;
use crate::transport::{BridgeTopics, BridgeTransport, Message, MessageLink, Transport};

const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// Gateway event, published on the shared event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Gateway started
    Started,
    /// Gateway stopped
    Stopped,
    /// Nothing was received for the configured silence period
    BusSilent {
        /// Seconds of silence
        seconds: u64,
    },
    /// A Home Assistant command could not be turned into a bus command
    CommandRejected {
        /// Topic the command came on
        topic: String,
        /// Why it was rejected
        reason: String,
    },
    /// Discovery configs were published
    DiscoveryPublished {
        /// Number of configs
        count: usize,
    },
}

/// Wallpad to MQTT gateway
pub struct Gateway {
    config: SharedConfig,
    registry: SharedRegistry,
    scheduler: Arc<CommandScheduler>,
    bridge: HaBridge,
    link: Arc<dyn MessageLink>,
    transport: BridgeTransport,
    diagnostics: Arc<DiagnosticsLog>,
    events: SharedEventBus,
    outbound: Arc<Mutex<mpsc::UnboundedReceiver<Packet>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Assemble a gateway on a broker link
    pub fn new(config: GatewayConfig, registry: SharedRegistry, link: Arc<dyn MessageLink>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let scheduler = CommandScheduler::from_config(&config, registry.clone(), outbound_tx);
        let transport = BridgeTransport::new(link.clone(), BridgeTopics::new(&config.mqtt.bridge_topic));

        Self {
            bridge: HaBridge::from_config(&config),
            diagnostics: Arc::new(DiagnosticsLog::from_config(&config.diagnostics)),
            config: SharedConfig::new(config),
            registry,
            scheduler: Arc::new(scheduler),
            link,
            transport,
            events: SharedEventBus::new(),
            outbound: Arc::new(Mutex::new(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &GatewayConfig {
        self.config.get()
    }

    /// Command scheduler
    pub fn scheduler(&self) -> &Arc<CommandScheduler> {
        &self.scheduler
    }

    /// Diagnostics log
    pub fn diagnostics(&self) -> &Arc<DiagnosticsLog> {
        &self.diagnostics
    }

    /// Event bus carrying [`GatewayEvent`]s
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    fn codec(&self) -> Result<Codec> {
        Ok(Codec::new(self.registry.snapshot()?, CodecOptions::from_config(self.config())))
    }

    fn emit(&self, event: GatewayEvent) {
        if let Err(e) = self.events.publish(event) {
            warn!("Failed to publish gateway event: {}", e);
        }
    }

    /// Subscribe to the bus and command topics and start the background tasks
    pub async fn start(self: &Arc<Self>, mut inbound: mpsc::Receiver<Message>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        self.transport.listen().await?;
        self.link.subscribe(&self.bridge.command_filter()).await?;
        self.scheduler.start().await?;

        let gateway = Arc::clone(self);
        tasks.push(tokio::spawn(
            async move {
                while let Some(message) = inbound.recv().await {
                    if let Err(e) = gateway.handle_message(&message).await {
                        warn!(topic = %message.topic, "Failed to handle message: {}", e);
                    }
                }
                debug!("Inbound channel closed");
            }
            .instrument(component_span("router", None)),
        ));

        // The receiver outlives the task so a restarted gateway keeps sending
        let outbound = Arc::clone(&self.outbound);
        let gateway = Arc::clone(self);
        tasks.push(tokio::spawn(
            async move {
                let mut outbound = outbound.lock().await;
                while let Some(packet) = outbound.recv().await {
                    if let Err(e) = gateway.transmit(packet).await {
                        warn!(packet = %packet, "Failed to send frame: {}", e);
                    }
                }
            }
            .instrument(component_span("sender", None)),
        ));

        let silence = self.config().watchdog.silence_secs;
        if silence > 0 {
            let gateway = Arc::clone(self);
            tasks.push(tokio::spawn(
                async move { gateway.watch_bus(Duration::from_secs(silence)).await }
                    .instrument(component_span("watchdog", None)),
            ));
        }

        self.emit(GatewayEvent::Started);
        info!(
            bridge = %self.config().mqtt.bridge_topic,
            prefix = %self.config().mqtt.topic_prefix,
            "Gateway started"
        );
        Ok(())
    }

    /// Stop the background tasks
    pub async fn stop(&self) -> Result<()> {
        self.scheduler.stop().await?;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.emit(GatewayEvent::Stopped);
        info!("Gateway stopped");
        Ok(())
    }

    /// Route one broker message
    pub async fn handle_message(&self, message: &Message) -> Result<()> {
        if message.topic == self.transport.topics().recv {
            return self.handle_bus_bytes(&message.payload).await;
        }

        let payload = message.text().unwrap_or_default();
        match self.bridge.parse_command(&message.topic, payload) {
            Some(command) => {
                let registry = self.registry.snapshot()?;
                let submitted = self
                    .bridge
                    .command_values(&registry, &command)
                    .and_then(|values| self.scheduler.submit(&command.device, &values));
                if let Err(e) = submitted {
                    warn!(topic = %message.topic, payload, "Command rejected: {}", e);
                    self.emit(GatewayEvent::CommandRejected {
                        topic: message.topic.clone(),
                        reason: e.to_string(),
                    });
                }
                Ok(())
            }
            None => {
                debug!(topic = %message.topic, "Ignoring message");
                Ok(())
            }
        }
    }

    /// Decode bytes read from the bus and act on them
    pub async fn handle_bus_bytes(&self, bytes: &[u8]) -> Result<()> {
        let codec = self.codec()?;
        let timestamp = now();

        for decoded in codec.decode_stream(bytes) {
            self.diagnostics.record(Direction::Recv, &decoded, timestamp);

            let receipt = match &decoded {
                Decoded::Known(_) | Decoded::Unknown(_) => decoded.packet(),
                Decoded::BadChecksum(packet) => {
                    debug!(target: BUS_TARGET, packet = %packet, "Checksum mismatch");
                    None
                }
                Decoded::Fragment(_) => None,
            };
            self.scheduler.on_receipt(receipt)?;

            if let Some(known) = decoded.known() {
                for message in self.bridge.state_messages(known) {
                    self.link.publish(message).await?;
                }
            }
        }
        Ok(())
    }

    async fn transmit(&self, packet: Packet) -> Result<()> {
        self.transport.send_raw(Bytes::copy_from_slice(packet.as_ref())).await?;
        let decoded = self.codec()?.decode(&packet);
        self.diagnostics.record(Direction::Send, &decoded, now());
        Ok(())
    }

    /// Send a typed-in frame straight to the bus, bypassing the queue
    ///
    /// A complete frame must carry a correct checksum; a payload without one
    /// gets it computed.
    pub async fn send_manual(&self, text: &str) -> Result<Packet> {
        let parsed: PacketText = text.parse()?;
        let packet = parsed.into_verified(self.config().queue.checksum)?;
        info!(packet = %packet, "Manual send");
        self.transmit(packet).await?;
        Ok(packet)
    }

    /// Re-read the packet tables and swap them in
    pub fn reload_registry(&self) -> Result<()> {
        let _span = operation_span("reload", "registry").entered();
        self.registry.reload(self.config())?;
        Ok(())
    }

    /// Announce found devices to Home Assistant
    pub async fn publish_discovery(&self, found: &FoundDevices) -> Result<usize> {
        let registry = self.registry.snapshot()?;
        let messages = self.bridge.discovery_messages(&registry, found);
        let count = messages.len();
        for message in messages {
            self.link.publish(message).await?;
        }
        info!(count, "Published discovery configs");
        self.emit(GatewayEvent::DiscoveryPublished { count });
        Ok(count)
    }

    async fn watch_bus(&self, silence: Duration) {
        let started = Instant::now();
        let mut warned_at: Option<Instant> = None;
        let mut interval = time::interval(WATCHDOG_PERIOD);
        loop {
            let now_instant = interval.tick().await;
            let last_receipt = match self.scheduler.last_receipt() {
                Ok(last) => last,
                Err(e) => {
                    warn!("Watchdog could not read the queue: {}", e);
                    continue;
                }
            };
            let reference = [Some(started), last_receipt, warned_at]
                .into_iter()
                .flatten()
                .max()
                .unwrap_or(started);
            if now_instant.saturating_duration_since(reference) < silence {
                continue;
            }

            let seconds = silence.as_secs();
            warn!("No bus traffic for {} seconds", seconds);
            self.diagnostics
                .notice(&format!("No bus traffic for {} seconds", seconds), now());
            self.emit(GatewayEvent::BusSilent { seconds });
            warned_at = Some(now_instant);
        }
    }
}

/// Listen to the bus for `window` and count the devices that report state
pub async fn scan_bus(
    codec: &Codec,
    link: &dyn MessageLink,
    topics: &BridgeTopics,
    inbound: &mut mpsc::Receiver<Message>,
    window: Duration,
) -> Result<FoundDevices> {
    link.subscribe(&topics.recv).await?;
    info!("Scanning the bus for {} seconds", window.as_secs());

    let mut scan = DeviceScan::new();
    let deadline = Instant::now() + window;
    loop {
        let message = match time::timeout_at(deadline, inbound.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => break,
        };
        if message.topic != topics.recv {
            continue;
        }
        for decoded in codec.decode_stream(&message.payload) {
            scan.observe(&decoded);
        }
    }

    debug!(observed = scan.observed(), "Scan finished");
    Ok(scan.finish())
}
