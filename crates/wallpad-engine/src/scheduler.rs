/*!
 * Command scheduler.
 *
 * Wraps the retry queue with the registry and a clock. Submissions are
 * encoded and given their confirmation pattern before they are queued, so a
 * bad device or value never reaches the bus. A background task ticks the
 * queue; frames to transmit are handed to an outbound channel and never
 * awaited, and receipts are fed in from the receive path.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use wallpad_core::config::GatewayConfig;
use wallpad_core::logging::component_span;
use wallpad_core::types::{ConfirmSource, Id};
use wallpad_core::utils::duration_to_millis;
use wallpad_protocol::{derive, Codec, CodecOptions, FieldValues, Packet, SharedRegistry};

use crate::error::{Error, Result};
use crate::queue::{CommandJob, CommandQueue, JobHandle, JobReport, QueueSettings};

/// Scheduler event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A command was accepted
    Queued {
        /// Job ID
        id: Id,
        /// Target device
        device: String,
        /// Encoded frame
        packet: Packet,
    },
    /// A command frame was handed to the transport
    Transmitted {
        /// Job ID
        id: Id,
        /// Target device
        device: String,
        /// Encoded frame
        packet: Packet,
        /// Transmission number, starting at 1
        attempt: u8,
    },
    /// A job reached a terminal state
    Finished(JobReport),
    /// Scheduler started
    SchedulerStarted,
    /// Scheduler stopped
    SchedulerStopped,
}

/// Snapshot of the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Jobs waiting
    pub pending: usize,
    /// Job holding the bus
    pub in_flight: Option<InFlightStatus>,
}

/// Progress of the in-flight job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightStatus {
    /// Job ID
    pub id: Id,
    /// Target device
    pub device: String,
    /// The command frame
    pub packet: Packet,
    /// Transmissions so far
    pub attempts: u8,
    /// Matching receipts so far
    pub matches: u8,
}

/// The parts the tick task shares with the scheduler
#[derive(Debug, Clone)]
struct Driver {
    queue: Arc<Mutex<CommandQueue>>,
    outbound: mpsc::UnboundedSender<Packet>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl Driver {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CommandQueue>> {
        self.queue
            .lock()
            .map_err(|_| Error::queue("Failed to acquire queue lock"))
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn tick(&self, now: Instant) -> Result<Option<Packet>> {
        let (result, in_flight) = {
            let mut queue = self.lock()?;
            let result = queue.tick(now);
            let in_flight = queue
                .in_flight()
                .map(|job| (job.id().clone(), job.device().to_string(), job.attempts_used()));
            (result, in_flight)
        };

        if let Some(report) = result.finished {
            self.emit(QueueEvent::Finished(report));
        }

        let packet = match result.transmit {
            Some(packet) => packet,
            None => return Ok(None),
        };
        if self.outbound.send(packet).is_err() {
            warn!(packet = %packet, "Outbound channel closed, frame dropped");
        }
        if let Some((id, device, attempt)) = in_flight {
            self.emit(QueueEvent::Transmitted {
                id,
                device,
                packet,
                attempt,
            });
        }
        Ok(Some(packet))
    }

    fn receipt(&self, packet: Option<&Packet>, now: Instant) -> Result<()> {
        let report = self.lock()?.on_receipt(packet, now);
        if let Some(report) = report {
            self.emit(QueueEvent::Finished(report));
        }
        Ok(())
    }
}

/// Command scheduler
#[derive(Debug)]
pub struct CommandScheduler {
    driver: Driver,
    registry: SharedRegistry,
    options: CodecOptions,
    confirm_with: HashMap<String, ConfirmSource>,
    tick_interval: Duration,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl CommandScheduler {
    /// Create a scheduler; transmissions are delivered to `outbound`
    pub fn new(
        registry: SharedRegistry,
        options: CodecOptions,
        settings: QueueSettings,
        tick_interval: Duration,
        outbound: mpsc::UnboundedSender<Packet>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            driver: Driver {
                queue: Arc::new(Mutex::new(CommandQueue::new(settings))),
                outbound,
                event_tx,
            },
            registry,
            options,
            confirm_with: HashMap::new(),
            tick_interval,
            tasks: AsyncMutex::new(Vec::new()),
        }
    }

    /// Create a scheduler from the gateway configuration
    pub fn from_config(
        config: &GatewayConfig,
        registry: SharedRegistry,
        outbound: mpsc::UnboundedSender<Packet>,
    ) -> Self {
        let mut scheduler = Self::new(
            registry,
            CodecOptions::from_config(config),
            QueueSettings::from_config(&config.queue),
            config.queue.tick_interval(),
            outbound,
        );
        scheduler.confirm_with = config.queue.confirm_with.clone();
        scheduler
    }

    /// Pick the confirmation source for a device
    pub fn set_confirm_source<S: Into<String>>(&mut self, device: S, source: ConfirmSource) {
        self.confirm_with.insert(device.into(), source);
    }

    /// Subscribe to scheduler events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.driver.event_tx.subscribe()
    }

    /// Encode a command and queue it
    ///
    /// Unknown devices, fields, symbols and out-of-range numbers are rejected
    /// here and nothing is queued.
    pub fn submit(&self, device: &str, values: &FieldValues) -> Result<JobHandle> {
        let codec = Codec::new(self.registry.snapshot()?, self.options);
        let packet = codec.encode_command(device, values)?;
        let source = self.confirm_with.get(device).copied().unwrap_or_default();
        let expected = derive(&codec, &packet, source)?;

        let (job, handle) = CommandJob::new(device, packet, expected);
        self.driver.lock()?.enqueue(job);
        info!(job = %handle.id(), device, packet = %packet, "Command submitted");
        self.driver.emit(QueueEvent::Queued {
            id: handle.id().clone(),
            device: device.to_string(),
            packet,
        });
        Ok(handle)
    }

    /// Feed a receipt; `None` for bytes that did not form a frame
    pub fn on_receipt(&self, packet: Option<&Packet>) -> Result<()> {
        self.driver.receipt(packet, Instant::now())
    }

    /// Run one scheduling step now, returning the frame it transmitted
    pub fn tick(&self) -> Result<Option<Packet>> {
        self.driver.tick(Instant::now())
    }

    /// Cancel a queued or in-flight job
    pub fn cancel(&self, id: &Id) -> Result<JobReport> {
        let report = self.driver.lock()?.cancel(id)?;
        self.driver.emit(QueueEvent::Finished(report.clone()));
        Ok(report)
    }

    /// Cancel whatever is queued for a device
    pub fn cancel_device(&self, device: &str) -> Result<usize> {
        let reports = self.driver.lock()?.cancel_device(device);
        let count = reports.len();
        for report in reports {
            self.driver.emit(QueueEvent::Finished(report));
        }
        Ok(count)
    }

    /// Current queue contents
    pub fn status(&self) -> Result<QueueStatus> {
        let queue = self.driver.lock()?;
        Ok(QueueStatus {
            pending: queue.pending_len(),
            in_flight: queue.in_flight().map(|job| InFlightStatus {
                id: job.id().clone(),
                device: job.device().to_string(),
                packet: *job.packet(),
                attempts: job.attempts_used(),
                matches: job.matches_observed(),
            }),
        })
    }

    /// When the bus last delivered anything
    pub fn last_receipt(&self) -> Result<Option<Instant>> {
        Ok(self.driver.lock()?.last_receipt())
    }

    /// Start the tick task
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        let driver = self.driver.clone();
        let period = self.tick_interval;
        let span = component_span("scheduler", None);
        tasks.push(tokio::spawn(
            async move {
                let mut interval = time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    // A delayed tick must not see a stale clock
                    if let Err(e) = driver.tick(Instant::now()) {
                        warn!("Scheduler tick failed: {}", e);
                    }
                }
            }
            .instrument(span),
        ));

        self.driver.emit(QueueEvent::SchedulerStarted);
        info!(tick_ms = duration_to_millis(period), "Command scheduler started");
        Ok(())
    }

    /// Stop the tick task; queued jobs stay queued
    pub async fn stop(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return Ok(());
        }
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("Tick task aborted");

        self.driver.emit(QueueEvent::SchedulerStopped);
        info!("Command scheduler stopped");
        Ok(())
    }

    /// Whether the tick task is running
    pub async fn is_running(&self) -> bool {
        !self.tasks.lock().await.is_empty()
    }
}
