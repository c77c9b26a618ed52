/*!
 * Expected-state derivation.
 *
 * The bus never acknowledges a command on its own. What the gateway can do
 * is predict the state or ack packet a device will emit once it has obeyed,
 * and wait for that packet. This module computes the prediction as a byte
 * pattern: each position is either a wildcard or a small set of accepted
 * bytes.
 */
use std::fmt;

use serde::Serialize;
use tracing::debug;

use wallpad_core::types::ConfirmSource;

use crate::codec::{Codec, Decoded, FieldValue};
use crate::error::{ProtocolError, Result};
use crate::packet::{hex_byte, Packet, FRAME_LEN};
use crate::structure::{FieldSpec, PacketSpec, PacketType, DEVICE_ID_FIELD};

/// Command field that selects which state field the `value` field drives
pub const COMMAND_TYPE_FIELD: &str = "commandType";
/// Command field whose meaning depends on `commandType`
pub const VALUE_FIELD: &str = "value";
/// Symbol that switches a device off
pub const OFF_SYMBOL: &str = "off";

/// Accepted bytes at one position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ByteMatch {
    /// Anything
    Any,
    /// One of these bytes
    OneOf(Vec<u8>),
}

impl ByteMatch {
    /// Exactly one byte
    pub fn exactly(byte: u8) -> Self {
        ByteMatch::OneOf(vec![byte])
    }

    /// Whether a byte is accepted
    pub fn accepts(&self, byte: u8) -> bool {
        match self {
            ByteMatch::Any => true,
            ByteMatch::OneOf(bytes) => bytes.contains(&byte),
        }
    }

    /// Whether the position is constrained
    pub fn is_required(&self) -> bool {
        matches!(self, ByteMatch::OneOf(_))
    }
}

impl fmt::Display for ByteMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteMatch::Any => write!(f, "**"),
            ByteMatch::OneOf(bytes) => {
                let parts: Vec<String> = bytes.iter().map(|b| hex_byte(*b)).collect();
                write!(f, "{}", parts.join("|"))
            }
        }
    }
}

/// Pattern a receipt of one packet type must satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BytePattern {
    /// Packet type the pattern was derived against
    pub packet_type: PacketType,
    /// Accepted bytes at positions 0 to 7
    pub positions: [ByteMatch; FRAME_LEN],
}

impl BytePattern {
    fn for_header(packet_type: PacketType, header: u8) -> Self {
        let mut positions: [ByteMatch; FRAME_LEN] = Default::default();
        positions[0] = ByteMatch::exactly(header);
        Self {
            packet_type,
            positions,
        }
    }

    /// Whether a packet satisfies every required position
    pub fn matches(&self, packet: &Packet) -> bool {
        self.positions
            .iter()
            .zip(packet.bytes().iter())
            .all(|(rule, byte)| rule.accepts(*byte))
    }

    /// Positions that are not wildcards
    pub fn required_positions(&self) -> Vec<usize> {
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_required())
            .map(|(pos, _)| pos)
            .collect()
    }
}

impl Default for ByteMatch {
    fn default() -> Self {
        ByteMatch::Any
    }
}

impl fmt::Display for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.positions.iter().map(|p| p.to_string()).collect();
        write!(f, "{} [{}]", self.packet_type, parts.join(" "))
    }
}

/// What confirms a command: any one of the alternative patterns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedState {
    /// Device the command targets
    pub device: String,
    /// One pattern per packet type allowed to confirm
    pub alternatives: Vec<BytePattern>,
}

impl ExpectedState {
    /// Whether a received packet confirms the command
    pub fn matches(&self, packet: &Packet) -> bool {
        self.alternatives.iter().any(|pattern| pattern.matches(packet))
    }

    /// Whether nothing can confirm the command
    ///
    /// A device with no state or ack packet for the chosen source gets no
    /// alternatives; its commands are sent the full number of times.
    pub fn is_blind(&self) -> bool {
        self.alternatives.is_empty()
    }

    /// Pattern derived against a packet type
    pub fn pattern(&self, packet_type: PacketType) -> Option<&BytePattern> {
        self.alternatives.iter().find(|p| p.packet_type == packet_type)
    }
}

/// State field a command field drives
///
/// The `value` field of a command follows its `commandType`; every other
/// field drives the state field of the same name.
pub fn target_field(command_type: &str) -> &str {
    match command_type {
        "power" => "power",
        "change" | "setTemp" => "targetTemp",
        "setSpeed" | "speed" => "speed",
        other => other,
    }
}

/// Derive the expected state for an encoded command
pub fn derive(codec: &Codec, command: &Packet, source: ConfirmSource) -> Result<ExpectedState> {
    let decoded = match codec.decode_as(command, PacketType::Command) {
        Decoded::Known(decoded) => decoded,
        Decoded::BadChecksum(packet) => {
            return Err(ProtocolError::invalid_packet(format!("bad checksum in {}", packet)))
        }
        other => {
            return Err(ProtocolError::invalid_packet(format!(
                "{} is not a registered command",
                other.hex()
            )))
        }
    };

    let device = codec.registry().device(&decoded.device)?;
    let targets: Vec<PacketType> = match source {
        ConfirmSource::State => vec![PacketType::State],
        ConfirmSource::Ack => vec![PacketType::Ack],
        ConfirmSource::Either => vec![PacketType::State, PacketType::Ack],
    };
    let targets: Vec<(PacketType, &PacketSpec)> = targets
        .into_iter()
        .filter_map(|t| device.packet(t).map(|spec| (t, spec)))
        .collect();
    if targets.is_empty() {
        debug!(device = %device.name, source = ?source, "No packet type can confirm the command");
        return Ok(ExpectedState {
            device: device.name.clone(),
            alternatives: Vec::new(),
        });
    }

    let effects = command_effects(codec, &decoded.device, &decoded.fields);

    let alternatives = targets
        .into_iter()
        .map(|(packet_type, spec)| {
            let mut pattern = BytePattern::for_header(packet_type, spec.header);
            if let (Some(pos), Some(id)) = (spec.device_id_position(), decoded.device_id) {
                pattern.positions[usize::from(pos)] = ByteMatch::exactly(id);
            }
            for (name, value) in &effects {
                if let Some((pos, field)) = spec.field(name) {
                    pattern.positions[usize::from(pos)] = translate(value, field);
                }
            }
            pattern
        })
        .collect();

    let expected = ExpectedState {
        device: device.name.clone(),
        alternatives,
    };
    debug!(device = %expected.device, command = %command, "Derived expected state");
    Ok(expected)
}

fn command_effects(
    codec: &Codec,
    device: &str,
    fields: &crate::codec::FieldValues,
) -> Vec<(String, FieldValue)> {
    let mut effects = Vec::new();
    let command_type = fields.get(COMMAND_TYPE_FIELD).and_then(FieldValue::as_symbol);

    if let (Some(command_type), Some(value)) = (command_type, fields.get(VALUE_FIELD)) {
        effects.push((target_field(command_type).to_string(), value.clone()));
    }

    let structural: Vec<&str> = codec
        .registry()
        .packet(device, PacketType::Command)
        .map(|spec| {
            spec.fields
                .values()
                .filter(|f| f.is_structural())
                .map(|f| f.name.as_str())
                .collect()
        })
        .unwrap_or_default();

    for (name, value) in fields {
        let name = name.as_str();
        if name == DEVICE_ID_FIELD || structural.contains(&name) {
            continue;
        }
        if command_type.is_some() && (name == COMMAND_TYPE_FIELD || name == VALUE_FIELD) {
            continue;
        }
        effects.push((name.to_string(), value.clone()));
    }
    effects
}

fn translate(value: &FieldValue, target: &FieldSpec) -> ByteMatch {
    match value {
        FieldValue::Symbol(symbol) => {
            if let Some(byte) = target.byte_for(symbol) {
                return ByteMatch::exactly(byte);
            }
            match target.byte_for(OFF_SYMBOL) {
                Some(off) if symbol != OFF_SYMBOL => ByteMatch::OneOf(
                    target
                        .values
                        .iter()
                        .map(|(_, b)| *b)
                        .filter(|b| *b != off)
                        .collect(),
                ),
                _ => ByteMatch::Any,
            }
        }
        FieldValue::Number(n) => target
            .encoding()
            .encode(*n)
            .map(ByteMatch::exactly)
            .unwrap_or(ByteMatch::Any),
        FieldValue::Raw(_) => ByteMatch::Any,
    }
}
