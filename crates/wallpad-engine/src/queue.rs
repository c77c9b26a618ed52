/*!
 * Command retry queue.
 *
 * Commands are sent one at a time. A job goes Pending -> InFlight when it is
 * first transmitted and stays in flight until enough matching receipts have
 * been seen (Confirmed) or the send budget is used up (Exhausted). Only then
 * does the next job get the bus.
 *
 * The queue is plain synchronous state driven by explicit instants; the
 * scheduler owns the clock and the locking.
 */
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use wallpad_core::config::QueueConfig;
use wallpad_core::types::Id;
use wallpad_protocol::{ExpectedState, Packet};

use crate::error::{Error, Result};

/// Timing and thresholds of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Bus idle time required before a transmission
    pub quiet: Duration,
    /// Spacing between transmissions of the same job
    pub retry: Duration,
    /// Transmissions allowed per job
    pub max_send: u8,
    /// Matching receipts that confirm a job
    pub min_receive: u8,
}

impl QueueSettings {
    /// Settings from the queue section of the configuration
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            quiet: config.quiet_interval(),
            retry: config.retry_interval(),
            max_send: config.max_send_count,
            min_receive: config.min_receive_count,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, never sent
    Pending,
    /// Sent at least once, waiting for receipts
    InFlight,
    /// Enough matching receipts arrived
    Confirmed,
    /// Gave up
    Exhausted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Confirmed => "confirmed",
            JobState::Exhausted => "exhausted",
        };
        write!(f, "{}", label)
    }
}

/// Why a job was given up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustReason {
    /// Every allowed transmission went unconfirmed
    RetryLimit,
    /// Cancelled from outside
    Cancelled,
}

/// Terminal result of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The device reported the commanded state
    Confirmed {
        /// Transmissions used
        attempts: u8,
        /// Matching receipts counted
        matches: u8,
    },
    /// The job ended without confirmation
    Exhausted {
        /// Transmissions used
        attempts: u8,
        /// Why it ended
        reason: ExhaustReason,
    },
}

impl JobOutcome {
    /// Whether the command was confirmed
    pub fn is_confirmed(&self) -> bool {
        matches!(self, JobOutcome::Confirmed { .. })
    }

    /// Terminal state this outcome corresponds to
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Confirmed { .. } => JobState::Confirmed,
            JobOutcome::Exhausted { .. } => JobState::Exhausted,
        }
    }
}

/// A queued command
#[derive(Debug)]
pub struct CommandJob {
    id: Id,
    device: String,
    packet: Packet,
    expected: ExpectedState,
    state: JobState,
    attempts_used: u8,
    matches_observed: u8,
    last_sent: Option<Instant>,
    notifier: Option<oneshot::Sender<JobOutcome>>,
}

impl CommandJob {
    /// Create a job and the handle that reports its outcome
    pub fn new(device: &str, packet: Packet, expected: ExpectedState) -> (Self, JobHandle) {
        let id = Id::new();
        let (tx, rx) = oneshot::channel();
        let job = Self {
            id: id.clone(),
            device: device.to_string(),
            packet,
            expected,
            state: JobState::Pending,
            attempts_used: 0,
            matches_observed: 0,
            last_sent: None,
            notifier: Some(tx),
        };
        (job, JobHandle { id, rx })
    }

    /// Job ID
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Target device
    pub fn device(&self) -> &str {
        &self.device
    }

    /// The frozen command frame
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Pattern a confirming receipt must match
    pub fn expected(&self) -> &ExpectedState {
        &self.expected
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Transmissions so far
    pub fn attempts_used(&self) -> u8 {
        self.attempts_used
    }

    /// Matching receipts so far
    pub fn matches_observed(&self) -> u8 {
        self.matches_observed
    }

    fn transmit(&mut self, now: Instant) -> Packet {
        self.state = JobState::InFlight;
        self.attempts_used = self.attempts_used.saturating_add(1);
        self.last_sent = Some(now);
        self.packet
    }

    fn finish(mut self, outcome: JobOutcome) -> JobReport {
        self.state = outcome.state();
        if let Some(notifier) = self.notifier.take() {
            // The submitter may have dropped its handle
            let _ = notifier.send(outcome);
        }
        JobReport {
            id: self.id,
            device: self.device,
            packet: self.packet,
            outcome,
        }
    }
}

/// Awaitable outcome of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    id: Id,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Job ID
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Wait until the job is confirmed or exhausted
    pub async fn outcome(self) -> Result<JobOutcome> {
        self.rx
            .await
            .map_err(|_| Error::queue(format!("Job {} was dropped before finishing", self.id)))
    }
}

/// A job that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    /// Job ID
    pub id: Id,
    /// Target device
    pub device: String,
    /// The command frame
    pub packet: Packet,
    /// How it ended
    pub outcome: JobOutcome,
}

/// What one tick did
#[derive(Debug, Default)]
pub struct TickResult {
    /// Frame to put on the bus
    pub transmit: Option<Packet>,
    /// Job that ended during the tick
    pub finished: Option<JobReport>,
}

/// FIFO of commands with a single in-flight slot
#[derive(Debug)]
pub struct CommandQueue {
    settings: QueueSettings,
    pending: VecDeque<CommandJob>,
    in_flight: Option<CommandJob>,
    last_receipt: Option<Instant>,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            pending: VecDeque::new(),
            in_flight: None,
            last_receipt: None,
        }
    }

    /// Queue settings
    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Add a job at the back of the queue
    pub fn enqueue(&mut self, job: CommandJob) -> Id {
        debug!(job = %job.id, device = %job.device, packet = %job.packet, "Queued command");
        let id = job.id.clone();
        self.pending.push_back(job);
        id
    }

    /// Jobs waiting behind the in-flight one
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Job currently holding the bus
    pub fn in_flight(&self) -> Option<&CommandJob> {
        self.in_flight.as_ref()
    }

    /// Whether nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// When the bus last delivered anything
    pub fn last_receipt(&self) -> Option<Instant> {
        self.last_receipt
    }

    /// Whether the bus has been quiet long enough to transmit
    pub fn gate_open(&self, now: Instant) -> bool {
        match self.last_receipt {
            Some(last) => now.saturating_duration_since(last) >= self.settings.quiet,
            None => true,
        }
    }

    /// Account for inbound traffic; `packet` is `None` for bytes that did not form a frame
    pub fn on_receipt(&mut self, packet: Option<&Packet>, now: Instant) -> Option<JobReport> {
        self.last_receipt = Some(now);

        let packet = packet?;
        let job = self.in_flight.as_mut()?;
        if !job.expected.matches(packet) {
            return None;
        }

        job.matches_observed = job.matches_observed.saturating_add(1);
        debug!(
            job = %job.id,
            device = %job.device,
            receipt = %packet,
            matches = job.matches_observed,
            "Matching receipt"
        );
        if job.matches_observed < self.settings.min_receive {
            return None;
        }

        let job = self.in_flight.take()?;
        let outcome = JobOutcome::Confirmed {
            attempts: job.attempts_used,
            matches: job.matches_observed,
        };
        info!(job = %job.id, device = %job.device, attempts = job.attempts_used, "Command confirmed");
        Some(job.finish(outcome))
    }

    /// Advance the in-flight job, or start the next one
    ///
    /// At most one frame is transmitted per tick, and only through the quiet
    /// gate. Giving up on a job does not need the gate.
    pub fn tick(&mut self, now: Instant) -> TickResult {
        let mut result = TickResult::default();
        let gate_open = self.gate_open(now);

        if let Some(job) = self.in_flight.as_mut() {
            let due = job
                .last_sent
                .map_or(true, |sent| now.saturating_duration_since(sent) >= self.settings.retry);
            if !due {
                return result;
            }

            if job.attempts_used >= self.settings.max_send {
                if let Some(job) = self.in_flight.take() {
                    if job.expected.is_blind() {
                        info!(job = %job.id, device = %job.device, attempts = job.attempts_used, "Command sent unconfirmed");
                    } else {
                        warn!(
                            job = %job.id,
                            device = %job.device,
                            attempts = job.attempts_used,
                            matches = job.matches_observed,
                            "Command not confirmed, giving up"
                        );
                    }
                    let outcome = JobOutcome::Exhausted {
                        attempts: job.attempts_used,
                        reason: ExhaustReason::RetryLimit,
                    };
                    result.finished = Some(job.finish(outcome));
                }
            } else {
                if gate_open {
                    let packet = job.transmit(now);
                    debug!(job = %job.id, attempt = job.attempts_used, packet = %packet, "Retransmitting");
                    result.transmit = Some(packet);
                }
                return result;
            }
        }

        if !gate_open {
            return result;
        }
        if let Some(mut job) = self.pending.pop_front() {
            let packet = job.transmit(now);
            debug!(job = %job.id, device = %job.device, packet = %packet, "Dispatching");
            self.in_flight = Some(job);
            result.transmit = Some(packet);
        }
        result
    }

    /// Cancel a job wherever it is; the in-flight slot is freed at once
    pub fn cancel(&mut self, id: &Id) -> Result<JobReport> {
        let job = if self.in_flight.as_ref().map_or(false, |job| &job.id == id) {
            self.in_flight.take()
        } else {
            self.pending
                .iter()
                .position(|job| &job.id == id)
                .and_then(|index| self.pending.remove(index))
        };

        let job = job.ok_or_else(|| Error::not_found(format!("Job {} is not queued", id)))?;
        info!(job = %job.id, device = %job.device, "Command cancelled");
        let outcome = JobOutcome::Exhausted {
            attempts: job.attempts_used,
            reason: ExhaustReason::Cancelled,
        };
        Ok(job.finish(outcome))
    }

    /// Cancel every queued job for a device, returning what was dropped
    pub fn cancel_device(&mut self, device: &str) -> Vec<JobReport> {
        let ids: Vec<Id> = self
            .in_flight
            .iter()
            .chain(self.pending.iter())
            .filter(|job| job.device == device)
            .map(|job| job.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.cancel(id).ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wallpad_protocol::{derive, field_values, Codec, CodecOptions, ConfirmSource, FieldValue, Registry};

    fn codec() -> Codec {
        let registry = Registry::load(Registry::builtin("commax").unwrap(), None).unwrap();
        Codec::new(Arc::new(registry), CodecOptions::default())
    }

    fn light_job(codec: &Codec, id: i64, power: &str) -> (CommandJob, JobHandle) {
        let values = field_values([("deviceId", FieldValue::Number(id)), ("power", FieldValue::symbol(power))]);
        let packet = codec.encode_command("Light", &values).unwrap();
        let expected = derive(codec, &packet, ConfirmSource::State).unwrap();
        CommandJob::new("Light", packet, expected)
    }

    fn settings(max_send: u8, min_receive: u8) -> QueueSettings {
        QueueSettings {
            quiet: Duration::from_millis(130),
            retry: Duration::from_millis(130),
            max_send,
            min_receive,
        }
    }

    fn light_state(id: u8, on: bool) -> Packet {
        let power = if on { 0x01 } else { 0x00 };
        Packet::seal([0xB0, power, id, 0, 0, 0, 0], Default::default())
    }

    #[test]
    fn test_exhausts_after_max_send() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(3, 1));
        let (job, mut handle) = light_job(&codec, 1, "on");
        queue.enqueue(job);

        let start = Instant::now();
        let mut sent = 0;
        let mut finished = None;
        for step in 0..100u64 {
            let result = queue.tick(start + Duration::from_millis(step * 10));
            if result.transmit.is_some() {
                sent += 1;
            }
            if let Some(report) = result.finished {
                finished = Some(report);
                break;
            }
        }

        assert_eq!(sent, 3);
        let report = finished.unwrap();
        assert_eq!(
            report.outcome,
            JobOutcome::Exhausted {
                attempts: 3,
                reason: ExhaustReason::RetryLimit
            }
        );
        assert!(queue.is_idle());
        assert_eq!(handle.rx.try_recv().unwrap(), report.outcome);
    }

    #[test]
    fn test_confirms_at_threshold() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(20, 3));
        let (job, _handle) = light_job(&codec, 1, "on");
        queue.enqueue(job);

        let start = Instant::now();
        assert!(queue.tick(start).transmit.is_some());
        assert_eq!(queue.in_flight().unwrap().state(), JobState::InFlight);

        let t = start + Duration::from_millis(20);
        assert!(queue.on_receipt(Some(&light_state(1, true)), t).is_none());
        // wrong device and wrong value do not count
        assert!(queue.on_receipt(Some(&light_state(2, true)), t).is_none());
        assert!(queue.on_receipt(Some(&light_state(1, false)), t).is_none());
        assert!(queue.on_receipt(Some(&light_state(1, true)), t).is_none());
        assert_eq!(queue.in_flight().unwrap().matches_observed(), 2);

        let report = queue.on_receipt(Some(&light_state(1, true)), t).unwrap();
        assert_eq!(
            report.outcome,
            JobOutcome::Confirmed {
                attempts: 1,
                matches: 3
            }
        );
        assert!(queue.in_flight().is_none());
    }

    #[test]
    fn test_quiet_gate_holds_dispatch() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(20, 1));
        let (job, _handle) = light_job(&codec, 1, "on");
        queue.enqueue(job);

        let start = Instant::now();
        queue.on_receipt(None, start);
        assert!(queue.tick(start + Duration::from_millis(100)).transmit.is_none());
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.tick(start + Duration::from_millis(130)).transmit.is_some());
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_quiet_gate_holds_retransmit() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(5, 1));
        let (job, _handle) = light_job(&codec, 1, "on");
        queue.enqueue(job);

        let start = Instant::now();
        assert!(queue.tick(start).transmit.is_some());
        queue.on_receipt(None, start + Duration::from_millis(100));

        // Retry is due at 130 ms but the bus spoke at 100 ms
        assert!(queue.tick(start + Duration::from_millis(130)).transmit.is_none());
        assert!(queue.tick(start + Duration::from_millis(229)).transmit.is_none());
        assert_eq!(queue.in_flight().unwrap().attempts_used(), 1);

        let packet = queue.tick(start + Duration::from_millis(230)).transmit.unwrap();
        assert_eq!(packet.header(), 0x31);
        assert_eq!(queue.in_flight().unwrap().attempts_used(), 2);
    }

    #[test]
    fn test_blind_command_is_sent_max_times() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(2, 1));
        let values = field_values([("deviceId", FieldValue::Number(1)), ("power", FieldValue::symbol("close"))]);
        let packet = codec.encode_command("Gas", &values).unwrap();
        // Gas has no ack packet, so nothing can confirm this
        let expected = derive(&codec, &packet, ConfirmSource::Ack).unwrap();
        assert!(expected.is_blind());
        let (job, _handle) = CommandJob::new("Gas", packet, expected);
        queue.enqueue(job);

        let start = Instant::now();
        assert_eq!(queue.tick(start).transmit, Some(packet));
        let closed = Packet::seal([0x90, 0x50, 0x01, 0, 0, 0, 0], Default::default());
        assert!(queue
            .on_receipt(Some(&closed), start + Duration::from_millis(10))
            .is_none());

        assert_eq!(queue.tick(start + Duration::from_millis(140)).transmit, Some(packet));
        let result = queue.tick(start + Duration::from_millis(270));
        assert!(result.transmit.is_none());
        assert_eq!(
            result.finished.unwrap().outcome,
            JobOutcome::Exhausted {
                attempts: 2,
                reason: ExhaustReason::RetryLimit
            }
        );
        assert!(queue.is_idle());
    }

    #[test]
    fn test_one_job_in_flight_at_a_time() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(2, 1));
        let (first, _h1) = light_job(&codec, 1, "on");
        let (second, _h2) = light_job(&codec, 2, "on");
        let first_packet = *first.packet();
        let second_packet = *second.packet();
        queue.enqueue(first);
        queue.enqueue(second);

        let start = Instant::now();
        let mut transmitted = Vec::new();
        for step in 0..10u64 {
            let now = start + Duration::from_millis(step * 130);
            if let Some(packet) = queue.tick(now).transmit {
                transmitted.push(packet);
            }
        }

        assert_eq!(
            transmitted,
            vec![first_packet, first_packet, second_packet, second_packet]
        );
    }

    #[test]
    fn test_receipts_outside_flight_are_ignored() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(20, 1));
        let (job, _handle) = light_job(&codec, 1, "on");
        queue.enqueue(job);

        let start = Instant::now();
        assert!(queue.on_receipt(Some(&light_state(1, true)), start).is_none());
        let result = queue.tick(start + Duration::from_millis(200));
        assert!(result.transmit.is_some());
        assert_eq!(queue.in_flight().unwrap().matches_observed(), 0);
    }

    #[test]
    fn test_cancel_frees_slot() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(20, 3));
        let (first, _h1) = light_job(&codec, 1, "on");
        let (second, _h2) = light_job(&codec, 2, "off");
        let (third, _h3) = light_job(&codec, 1, "off");
        let first_id = queue.enqueue(first);
        let second_id = queue.enqueue(second);
        queue.enqueue(third);

        let start = Instant::now();
        queue.tick(start);
        let report = queue.cancel(&first_id).unwrap();
        assert_eq!(
            report.outcome,
            JobOutcome::Exhausted {
                attempts: 1,
                reason: ExhaustReason::Cancelled
            }
        );
        assert!(queue.in_flight().is_none());

        let report = queue.cancel(&second_id).unwrap();
        assert_eq!(report.device, "Light");
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.cancel(&second_id).is_err());

        // Next tick starts the remaining job
        let packet = queue.tick(start + Duration::from_millis(10)).transmit.unwrap();
        assert_eq!(packet.byte(1), Some(0x01));
        assert_eq!(packet.byte(2), Some(0x00));
    }

    #[test]
    fn test_cancel_device() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(20, 3));
        let (first, _h1) = light_job(&codec, 1, "on");
        let (second, _h2) = light_job(&codec, 2, "on");
        queue.enqueue(first);
        queue.enqueue(second);

        assert_eq!(queue.cancel_device("Light").len(), 2);
        assert_eq!(queue.cancel_device("Fan").len(), 0);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_handle_reports_outcome() {
        let codec = codec();
        let mut queue = CommandQueue::new(settings(1, 1));
        let (job, handle) = light_job(&codec, 1, "on");
        queue.enqueue(job);

        let mut outcome = tokio_test::task::spawn(handle.outcome());
        tokio_test::assert_pending!(outcome.poll());

        let start = Instant::now();
        queue.tick(start);
        queue.on_receipt(Some(&light_state(1, true)), start + Duration::from_millis(5));
        assert!(outcome.is_woken());
        let outcome = tokio_test::assert_ready_ok!(outcome.poll());
        assert!(outcome.is_confirmed());
    }

    #[test]
    fn test_dropped_job_fails_handle() {
        let codec = codec();
        let (job, handle) = light_job(&codec, 1, "on");
        drop(job);
        let result = tokio_test::block_on(handle.outcome());
        assert!(matches!(result, Err(Error::Queue(_))));
    }
}
