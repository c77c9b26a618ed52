/*!
 * Diagnostics feed.
 *
 * Every frame sent or received is recorded with its classification. The log
 * keeps the most recent events for display, broadcasts them live, and can
 * export them as a flat timestamped text log.
 */
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use wallpad_core::config::DiagnosticsConfig;
use wallpad_core::logging::BUS_TARGET;
use wallpad_core::types::Timestamp;
use wallpad_protocol::Decoded;

use crate::error::{Error, Result};

/// Which way a frame travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Gateway to bus
    Send,
    /// Bus to gateway
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Recv => write!(f, "recv"),
        }
    }
}

/// One entry of the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    /// A frame on the bus
    Packet {
        /// When it was seen
        timestamp: Timestamp,
        /// Which way it went
        direction: Direction,
        /// Upper-case hex of the raw bytes
        hex: String,
        /// Device, or `Unknown`
        device: String,
        /// Packet type label
        packet_type: String,
    },
    /// Something about the bus worth showing, such as a silence warning
    Notice {
        /// When it happened
        timestamp: Timestamp,
        /// What happened
        message: String,
    },
}

impl DiagnosticEvent {
    /// Build a packet event from a classified frame
    pub fn packet(direction: Direction, decoded: &Decoded, timestamp: Timestamp) -> Self {
        let (device, packet_type) = decoded.labels();
        DiagnosticEvent::Packet {
            timestamp,
            direction,
            hex: decoded.hex(),
            device,
            packet_type,
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DiagnosticEvent::Packet { timestamp, .. } | DiagnosticEvent::Notice { timestamp, .. } => *timestamp,
        }
    }
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.timestamp().format("%Y-%m-%d %H:%M:%S%.3f");
        match self {
            DiagnosticEvent::Packet {
                direction,
                hex,
                device,
                packet_type,
                ..
            } => write!(f, "{} {} {} {} {}", time, direction, hex, device, packet_type),
            DiagnosticEvent::Notice { message, .. } => write!(f, "{} note {}", time, message),
        }
    }
}

/// Receiver of the diagnostics feed
pub trait DiagnosticsSink: Send + Sync {
    /// Record a frame together with its classification
    fn record(&self, direction: Direction, decoded: &Decoded, timestamp: Timestamp);

    /// Record a free-form notice
    fn notice(&self, _message: &str, _timestamp: Timestamp) {}
}

/// Bounded in-memory diagnostics log
#[derive(Debug)]
pub struct DiagnosticsLog {
    recent: Mutex<VecDeque<DiagnosticEvent>>,
    capacity: usize,
    event_tx: broadcast::Sender<DiagnosticEvent>,
}

impl DiagnosticsLog {
    /// Create a log that keeps `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            event_tx,
        }
    }

    /// Create a log from the diagnostics configuration
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self::new(config.recent_capacity)
    }

    /// Subscribe to live events
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.event_tx.subscribe()
    }

    /// Add an event, dropping the oldest when full
    pub fn push(&self, event: DiagnosticEvent) -> Result<()> {
        {
            let mut recent = self
                .recent
                .lock()
                .map_err(|_| Error::other("Failed to acquire diagnostics lock"))?;
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        // No live viewers is fine
        let _ = self.event_tx.send(event);
        Ok(())
    }

    /// Events currently kept, oldest first
    pub fn recent(&self) -> Result<Vec<DiagnosticEvent>> {
        let recent = self
            .recent
            .lock()
            .map_err(|_| Error::other("Failed to acquire diagnostics lock"))?;
        Ok(recent.iter().cloned().collect())
    }

    /// Kept events as a text log, one line each
    pub fn export_text(&self) -> Result<String> {
        let mut text = String::new();
        for event in self.recent()? {
            text.push_str(&event.to_string());
            text.push('\n');
        }
        Ok(text)
    }

    /// Forget everything kept so far
    pub fn clear(&self) -> Result<()> {
        self.recent
            .lock()
            .map_err(|_| Error::other("Failed to acquire diagnostics lock"))?
            .clear();
        Ok(())
    }
}

impl DiagnosticsSink for DiagnosticsLog {
    fn record(&self, direction: Direction, decoded: &Decoded, timestamp: Timestamp) {
        let event = DiagnosticEvent::packet(direction, decoded, timestamp);
        debug!(target: BUS_TARGET, "{}", event);
        if let Err(e) = self.push(event) {
            warn!("Failed to record diagnostics event: {}", e);
        }
    }

    fn notice(&self, message: &str, timestamp: Timestamp) {
        let event = DiagnosticEvent::Notice {
            timestamp,
            message: message.to_string(),
        };
        if let Err(e) = self.push(event) {
            warn!("Failed to record diagnostics notice: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use wallpad_protocol::{Codec, CodecOptions, Registry};

    fn codec() -> Codec {
        let registry = Registry::load(Registry::builtin("commax").unwrap(), None).unwrap();
        Codec::new(Arc::new(registry), CodecOptions::default())
    }

    fn at(second: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap()
    }

    #[test]
    fn test_log_keeps_recent() {
        let codec = codec();
        let log = DiagnosticsLog::new(2);
        let frames = codec.decode_stream(&[
            0xB0, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0xB2, // Light 1 on
            0x55, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x56, // nothing registered
            0x31, 0x01, 0x01, // cut short
        ]);
        assert_eq!(frames.len(), 3);
        for (i, decoded) in frames.iter().enumerate() {
            log.record(Direction::Recv, decoded, at(i as u32));
        }

        let recent = log.recent().unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(
            recent[0],
            DiagnosticEvent::Packet {
                timestamp: at(1),
                direction: Direction::Recv,
                hex: "5501000000000056".to_string(),
                device: "Unknown".to_string(),
                packet_type: "Unknown".to_string(),
            }
        );
        match &recent[1] {
            DiagnosticEvent::Packet { packet_type, hex, .. } => {
                assert_eq!(packet_type, "fragment");
                assert_eq!(hex, "310101");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_export_text() {
        let codec = codec();
        let log = DiagnosticsLog::new(10);
        let light = codec.decode_stream(&[0xB0, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0xB2]);
        log.record(Direction::Recv, &light[0], at(3));
        log.notice("Bus silent for 10s", at(4));

        let text = log.export_text().unwrap();
        assert_eq!(
            text,
            "2024-05-01 12:00:03.000 recv B0010100000000B2 Light state\n\
             2024-05-01 12:00:04.000 note Bus silent for 10s\n"
        );

        log.clear().unwrap();
        assert!(log.export_text().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_feed() {
        let codec = codec();
        let log = DiagnosticsLog::new(10);
        let mut rx = log.subscribe();
        let sent = codec.decode_stream(&[0x31, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x33]);
        log.record(Direction::Send, &sent[0], at(0));

        match rx.recv().await.unwrap() {
            DiagnosticEvent::Packet {
                direction,
                device,
                packet_type,
                ..
            } => {
                assert_eq!(direction, Direction::Send);
                assert_eq!(device, "Light");
                assert_eq!(packet_type, "command");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
