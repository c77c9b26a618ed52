/*!
 * Wallpad Core
 *
 * This crate provides the shared plumbing of the wallpad gateway:
 * configuration, the error type, logging setup and the typed event bus.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

pub use error::{Error, Result};

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// Wallpad core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
