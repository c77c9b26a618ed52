/*!
 * Core data types for the wallpad gateway.
 *
 * Identifiers, timestamps and the small closed vocabularies shared by the
 * configuration layer and the protocol engine.
 */
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// A unique identifier for gateway resources such as queued commands
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

/// Wall-clock timestamp used in logs and exports
pub type Timestamp = DateTime<Utc>;

/// Current wall-clock time
pub fn now() -> Timestamp {
    Utc::now()
}

/// Checksum arithmetic over the seven payload bytes of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// Byte sum modulo 256
    #[default]
    Sum,
    /// Byte-wise exclusive or
    Xor,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Sum => write!(f, "sum"),
            ChecksumKind::Xor => write!(f, "xor"),
        }
    }
}

impl FromStr for ChecksumKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Ok(ChecksumKind::Sum),
            "xor" => Ok(ChecksumKind::Xor),
            other => Err(Error::config(format!("unknown checksum kind '{}'", other))),
        }
    }
}

/// Which received packet types may confirm a command for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmSource {
    /// Only state packets
    State,
    /// Only ack packets
    Ack,
    /// Whichever of state and ack the device defines
    #[default]
    Either,
}

impl fmt::Display for ConfirmSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmSource::State => write!(f, "state"),
            ConfirmSource::Ack => write!(f, "ack"),
            ConfirmSource::Either => write!(f, "either"),
        }
    }
}
