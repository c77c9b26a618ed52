/*!
 * Raw bus frames.
 *
 * Every frame on the wallpad bus is eight bytes: a header, six payload
 * bytes and a checksum over the first seven. This module owns the byte
 * and text forms of a frame, the checksum arithmetic and the splitting of
 * batched receive buffers into frames.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use wallpad_core::types::ChecksumKind;

use crate::error::{ProtocolError, Result};

/// Bytes in a complete frame
pub const FRAME_LEN: usize = 8;

/// Bytes covered by the checksum
pub const PAYLOAD_LEN: usize = 7;

/// Index of the checksum byte
pub const CHECKSUM_POS: usize = 7;

/// Compute the checksum of seven payload bytes
pub fn checksum(kind: ChecksumKind, payload: &[u8; PAYLOAD_LEN]) -> u8 {
    match kind {
        ChecksumKind::Sum => payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
        ChecksumKind::Xor => payload.iter().fold(0u8, |acc, b| acc ^ b),
    }
}

/// One eight-byte bus frame
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Packet([u8; FRAME_LEN]);

impl Packet {
    /// Wrap eight raw bytes as received, without checking the checksum
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Append the checksum to seven payload bytes
    pub fn seal(payload: [u8; PAYLOAD_LEN], kind: ChecksumKind) -> Self {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[..PAYLOAD_LEN].copy_from_slice(&payload);
        bytes[CHECKSUM_POS] = checksum(kind, &payload);
        Self(bytes)
    }

    /// Seal a payload given shorter than seven bytes, padding it with zeros
    pub fn seal_prefix(prefix: &[u8], kind: ChecksumKind) -> Result<Self> {
        if prefix.is_empty() || prefix.len() > PAYLOAD_LEN {
            return Err(ProtocolError::invalid_packet(format!(
                "payload must be 1 to {} bytes, got {}",
                PAYLOAD_LEN,
                prefix.len()
            )));
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..prefix.len()].copy_from_slice(prefix);
        Ok(Self::seal(payload, kind))
    }

    /// The eight frame bytes
    pub fn bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// The seven bytes the checksum covers
    pub fn payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&self.0[..PAYLOAD_LEN]);
        payload
    }

    /// The header byte
    pub fn header(&self) -> u8 {
        self.0[0]
    }

    /// The byte at `position` (0 to 7)
    pub fn byte(&self, position: usize) -> Option<u8> {
        self.0.get(position).copied()
    }

    /// The trailing checksum byte
    pub fn checksum_byte(&self) -> u8 {
        self.0[CHECKSUM_POS]
    }

    /// Whether the trailing byte matches the payload
    pub fn checksum_ok(&self, kind: ChecksumKind) -> bool {
        checksum(kind, &self.payload()) == self.checksum_byte()
    }

    /// Upper-case hex without separators
    pub fn to_hex(&self) -> String {
        hex_string(&self.0)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self.to_hex())
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A frame typed in by hand
///
/// Fourteen hex digits are a payload still missing its checksum, sixteen are
/// a complete frame. The two are never treated as the same input, even when
/// the trailing byte of the complete one happens to be the right checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketText {
    /// Payload only
    Partial([u8; PAYLOAD_LEN]),
    /// Payload and checksum
    Complete([u8; FRAME_LEN]),
}

impl PacketText {
    /// Frame for display: a partial payload gets its checksum computed, a
    /// complete frame is kept byte for byte
    pub fn to_packet(&self, kind: ChecksumKind) -> Packet {
        match self {
            PacketText::Partial(payload) => Packet::seal(*payload, kind),
            PacketText::Complete(bytes) => Packet::from_bytes(*bytes),
        }
    }

    /// Frame fit for transmission: a complete frame must carry a valid checksum
    pub fn into_verified(self, kind: ChecksumKind) -> Result<Packet> {
        let packet = self.to_packet(kind);
        if !packet.checksum_ok(kind) {
            return Err(ProtocolError::invalid_packet(format!(
                "checksum mismatch in {}: expected {}",
                packet,
                hex_byte(checksum(kind, &packet.payload()))
            )));
        }
        Ok(packet)
    }

    /// Whether the text carried its own checksum
    pub fn is_complete(&self) -> bool {
        matches!(self, PacketText::Complete(_))
    }
}

impl FromStr for PacketText {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = parse_hex(s)?;
        match bytes.len() {
            PAYLOAD_LEN => {
                let mut payload = [0u8; PAYLOAD_LEN];
                payload.copy_from_slice(&bytes);
                Ok(PacketText::Partial(payload))
            }
            FRAME_LEN => {
                let mut frame = [0u8; FRAME_LEN];
                frame.copy_from_slice(&bytes);
                Ok(PacketText::Complete(frame))
            }
            n => Err(ProtocolError::invalid_packet(format!(
                "expected 14 or 16 hex digits, got {}",
                n * 2
            ))),
        }
    }
}

/// Parse hex text into bytes; spaces and dashes are ignored, case is not significant
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    hex::decode(&digits).map_err(|e| ProtocolError::invalid_packet(format!("'{}' is not hex: {}", text, e)))
}

/// Upper-case hex without separators
pub fn hex_string(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// One byte as two upper-case hex digits
pub fn hex_byte(byte: u8) -> String {
    hex::encode_upper([byte])
}

/// A piece of a receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Eight bytes, checksum not yet verified
    Whole(Packet),
    /// Trailing bytes too short to be a frame
    Fragment(Vec<u8>),
}

/// Split a receive buffer into consecutive frames
pub fn split_frames(buffer: &[u8]) -> Vec<Frame> {
    let mut chunks = buffer.chunks_exact(FRAME_LEN);
    let mut frames: Vec<Frame> = chunks
        .by_ref()
        .map(|chunk| {
            let mut bytes = [0u8; FRAME_LEN];
            bytes.copy_from_slice(chunk);
            Frame::Whole(Packet::from_bytes(bytes))
        })
        .collect();

    let rest = chunks.remainder();
    if !rest.is_empty() {
        frames.push(Frame::Fragment(rest.to_vec()));
    }
    frames
}
