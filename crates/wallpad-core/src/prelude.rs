/*!
 * Prelude module for wallpad core.
 *
 * This module re-exports commonly used types and functions from the core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{ChecksumKind, ConfirmSource, Id, Timestamp};

// Re-export event types
pub use crate::event::{EventBus, SharedEventBus};

// Re-export config types
pub use crate::config::{ConfigBuilder, GatewayConfig, SharedConfig};

// Re-export utility functions
pub use crate::utils::{duration_to_millis, millis_to_duration};

pub use tracing::{debug, error, info, trace, warn};
