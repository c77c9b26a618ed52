/*!
 * Wallpad Protocol
 *
 * This crate provides the packet side of the wallpad gateway: the raw frame
 * forms, the per-vendor packet structure registry, the codec, and the
 * derivation of the packet that confirms a command.
 */

#![warn(missing_docs)]

pub mod analysis;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod expected;
pub mod packet;
pub mod registry;
pub mod structure;

pub use analysis::{analyze, Analysis};
pub use codec::{field_values, Codec, CodecOptions, Decoded, DecodedPacket, FieldValue, FieldValues};
pub use discovery::{DeviceScan, FoundDevice, FoundDevices};
pub use error::{ProtocolError, RegistryError, Result};
pub use expected::{derive, ByteMatch, BytePattern, ExpectedState};
pub use packet::{hex_byte, Packet, PacketText};
pub use registry::{Registry, SharedRegistry};
pub use structure::{DeviceKind, DeviceStructure, FieldSpec, PacketSpec, PacketType, StructureDocument};

pub use wallpad_core::types::{ChecksumKind, ConfirmSource};

/// Wallpad protocol crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
