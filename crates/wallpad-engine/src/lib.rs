/*!
 * Wallpad Engine
 *
 * This crate runs the gateway: the command retry queue and its scheduler,
 * the transport adapters, the Home Assistant topic bridge and the
 * diagnostics feed.
 */

#![warn(missing_docs)]

pub use wallpad_core::prelude;

pub mod bridge;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod scheduler;
pub mod transport;

pub use bridge::{HaBridge, HaCommand};
pub use diagnostics::{DiagnosticEvent, DiagnosticsLog, DiagnosticsSink, Direction};
pub use error::{Error, Result};
pub use gateway::{scan_bus, Gateway, GatewayEvent};
pub use queue::{CommandJob, CommandQueue, ExhaustReason, JobHandle, JobOutcome, JobReport, JobState, QueueSettings};
pub use scheduler::{CommandScheduler, QueueEvent, QueueStatus};
pub use transport::{BridgeTopics, BridgeTransport, Message, MessageLink, Transport};

#[cfg(feature = "mqtt")]
pub use transport::MqttLink;

/// Wallpad engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
