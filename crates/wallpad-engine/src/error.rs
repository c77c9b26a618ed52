/*!
 * Error types for the wallpad engine crate.
 */
use thiserror::Error;

/// Error type for wallpad engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Retry queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Home Assistant bridge error
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] wallpad_protocol::ProtocolError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] wallpad_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for wallpad engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new queue error
    pub fn queue<S: AsRef<str>>(msg: S) -> Self {
        Error::Queue(msg.as_ref().to_string())
    }

    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        Error::Transport(msg.as_ref().to_string())
    }

    /// Create a new bridge error
    pub fn bridge<S: AsRef<str>>(msg: S) -> Self {
        Error::Bridge(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
