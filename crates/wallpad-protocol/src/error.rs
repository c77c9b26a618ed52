/*!
 * Error types for the packet protocol layer.
 */
use thiserror::Error;

use crate::structure::PacketType;

/// What was wrong with a packet structure document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The document could not be parsed at all
    #[error("malformed structure document: {0}")]
    Malformed(String),

    /// A device entry is missing a required key or has a bad one
    #[error("device {device}: {reason}")]
    InvalidDevice {
        /// Device name
        device: String,
        /// What is wrong
        reason: String,
    },

    /// A header or value byte is not two hex digits
    #[error("device {device} {packet_type}: '{text}' is not a two-digit hex byte")]
    BadHex {
        /// Device name
        device: String,
        /// Packet type
        packet_type: PacketType,
        /// Offending text
        text: String,
    },

    /// A structure key outside positions 1 to 7
    #[error("device {device} {packet_type}: invalid byte position '{position}'")]
    BadPosition {
        /// Device name
        device: String,
        /// Packet type
        packet_type: PacketType,
        /// Offending key
        position: String,
    },

    /// Position 7 carries something other than the checksum
    #[error("device {device} {packet_type}: position 7 is reserved for the checksum, found '{name}'")]
    ChecksumPosition {
        /// Device name
        device: String,
        /// Packet type
        packet_type: PacketType,
        /// Field name found at position 7
        name: String,
    },

    /// The same field name appears twice in one packet type
    #[error("device {device} {packet_type}: field '{name}' appears at positions {first} and {second}")]
    DuplicateField {
        /// Device name
        device: String,
        /// Packet type
        packet_type: PacketType,
        /// Field name
        name: String,
        /// First position
        first: u8,
        /// Second position
        second: u8,
    },

    /// Two symbols of one field map to the same byte
    #[error("device {device} {packet_type}: field '{field}' maps '{first}' and '{second}' to the same byte")]
    DuplicateValue {
        /// Device name
        device: String,
        /// Packet type
        packet_type: PacketType,
        /// Field name
        field: String,
        /// First symbol
        first: String,
        /// Second symbol
        second: String,
    },

    /// Two devices share a header within one packet type
    #[error("{packet_type} header {header:02X} is claimed by both {first} and {second}")]
    DuplicateHeader {
        /// Packet type
        packet_type: PacketType,
        /// Header byte
        header: u8,
        /// First device
        first: String,
        /// Second device
        second: String,
    },

    /// No vendor table is known under the name
    #[error("unknown vendor '{0}'")]
    UnknownVendor(String),
}

/// Error type for protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The structure document is unusable
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The device is not in the registry
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// The device has no packet of the requested type
    #[error("Device {device} has no {packet_type} packet")]
    MissingPacketType {
        /// Device name
        device: String,
        /// Packet type
        packet_type: PacketType,
    },

    /// A field of the packet type does not exist
    #[error("Device {device} {packet_type} has no field '{field}'")]
    UnknownField {
        /// Device name
        device: String,
        /// Packet type
        packet_type: PacketType,
        /// Requested field
        field: String,
    },

    /// A symbolic value is not registered for the field
    #[error("Field '{field}' of {device} has no value '{symbol}'")]
    UnknownSymbol {
        /// Device name
        device: String,
        /// Field name
        field: String,
        /// Requested symbol
        symbol: String,
    },

    /// A literal value does not fit the field
    #[error("Value {value} for field '{field}' of {device} is outside {min}..={max}")]
    OutOfRange {
        /// Device name
        device: String,
        /// Field name
        field: String,
        /// Requested value
        value: i64,
        /// Lowest accepted value
        min: i64,
        /// Highest accepted value
        max: i64,
    },

    /// Input is not a packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// I/O error while reading or writing a document
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl ProtocolError {
    /// Create a new invalid packet error
    pub fn invalid_packet<S: AsRef<str>>(msg: S) -> Self {
        ProtocolError::InvalidPacket(msg.as_ref().to_string())
    }

    /// Create a new unknown device error
    pub fn unknown_device<S: AsRef<str>>(device: S) -> Self {
        ProtocolError::UnknownDevice(device.as_ref().to_string())
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
