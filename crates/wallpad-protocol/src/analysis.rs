/*!
 * Byte-by-byte explanation of a typed-in packet.
 */
use std::fmt;

use serde::Serialize;

use wallpad_core::types::ConfirmSource;

use crate::codec::{decode_byte, Codec, Decoded};
use crate::error::Result;
use crate::expected::{derive, ExpectedState};
use crate::packet::{checksum, hex_byte, Packet, PacketText, CHECKSUM_POS};
use crate::structure::PacketType;

/// Description of one byte
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ByteNote {
    /// Position in the frame
    pub position: usize,
    /// The byte
    pub byte: u8,
    /// What it means
    pub description: String,
}

impl fmt::Display for ByteNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Byte {}: {} {}", self.position, hex_byte(self.byte), self.description)
    }
}

/// Result of analysing a packet
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    /// The frame, with a computed checksum when the input had none
    pub packet: String,
    /// Whether the input carried its own checksum
    pub complete: bool,
    /// Checksum the payload should carry
    pub expected_checksum: u8,
    /// Whether the frame's checksum byte is right
    pub checksum_ok: bool,
    /// Device, or `Unknown`
    pub device: String,
    /// Packet type label
    pub packet_type: String,
    /// One note per byte
    pub bytes: Vec<ByteNote>,
    /// Confirmation pattern, for commands
    pub expected: Option<ExpectedState>,
}

/// Analyse hex text, optionally forcing a packet type
pub fn analyze(
    codec: &Codec,
    text: &str,
    packet_type: Option<PacketType>,
    source: ConfirmSource,
) -> Result<Analysis> {
    let parsed: PacketText = text.parse()?;
    let kind = codec.options().checksum;
    let packet = parsed.to_packet(kind);
    let expected_checksum = checksum(kind, &packet.payload());
    let checksum_ok = packet.checksum_byte() == expected_checksum;

    // Classify the payload even when a typed checksum is wrong
    let sealed = Packet::seal(packet.payload(), kind);
    let decoded = match packet_type {
        Some(packet_type) => codec.decode_as(&sealed, packet_type),
        None => codec.decode(&sealed),
    };
    let (device, type_label) = decoded.labels();

    let bytes = describe(codec, &packet, &decoded);

    let expected = match decoded.known() {
        Some(known) if known.packet_type == PacketType::Command => derive(codec, &sealed, source).ok(),
        _ => None,
    };

    Ok(Analysis {
        packet: packet.to_hex(),
        complete: parsed.is_complete(),
        expected_checksum,
        checksum_ok,
        device,
        packet_type: type_label,
        bytes,
        expected,
    })
}

fn describe(codec: &Codec, packet: &Packet, decoded: &Decoded) -> Vec<ByteNote> {
    let spec = decoded
        .known()
        .and_then(|known| codec.registry().lookup(known.packet_type, known.packet.header()));

    packet
        .bytes()
        .iter()
        .enumerate()
        .map(|(position, byte)| {
            let description = if position == 0 {
                match decoded.known() {
                    Some(known) => format!("header = {} {}", known.device, known.packet_type),
                    None => "header = unknown".to_string(),
                }
            } else if position == CHECKSUM_POS {
                "checksum".to_string()
            } else {
                match spec.and_then(|(_, spec)| spec.field_at(position as u8)) {
                    Some(field) if field.is_empty() => "(00)".to_string(),
                    Some(field) => format!("{} = {}", field.name, decode_byte(field, *byte)),
                    None => "-".to_string(),
                }
            };
            ByteNote {
                position,
                byte: *byte,
                description,
            }
        })
        .collect()
}
