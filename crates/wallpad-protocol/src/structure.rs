/*!
 * Packet structure documents.
 *
 * A structure document is a YAML mapping from device name to the shapes of
 * the packets that device uses:
 *
 * ```yaml
 * Light:
 *   type: light
 *   command:
 *     header: '31'
 *     structure:
 *       '1': {name: deviceId}
 *       '2': {name: power, values: {'on': '01', 'off': '00'}}
 * ```
 *
 * Parsing keeps the document order of devices and value tables so that a
 * document read and written back keeps its shape.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use tracing::debug;
use yaml_rust::yaml::Hash;
use yaml_rust::{Yaml, YamlEmitter, YamlLoader};

use crate::error::{ProtocolError, RegistryError, Result};
use crate::packet::{hex_byte, CHECKSUM_POS};

/// Field name fixed at `00`
pub const EMPTY_FIELD: &str = "empty";
/// Field name of the trailing checksum
pub const CHECKSUM_FIELD: &str = "checksum";
/// Field name of the device number byte
pub const DEVICE_ID_FIELD: &str = "deviceId";
/// Field name of bytes nobody has decoded yet
pub const UNKNOWN_FIELD: &str = "unknown";

/// The four kinds of packet a device may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    /// Sent by the gateway to change a device
    Command,
    /// Periodic or triggered report of a device's state
    State,
    /// Poll asking a device for its state
    StateRequest,
    /// Short reply acknowledging a command
    Ack,
}

impl PacketType {
    /// All packet types in document order
    pub const ALL: [PacketType; 4] = [
        PacketType::Command,
        PacketType::State,
        PacketType::StateRequest,
        PacketType::Ack,
    ];

    /// Document key of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Command => "command",
            PacketType::State => "state",
            PacketType::StateRequest => "state_request",
            PacketType::Ack => "ack",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PacketType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        PacketType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::invalid_packet(format!("unknown packet type '{}'", s)))
    }
}

/// What a device is, as far as Home Assistant is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// On/off light
    Light,
    /// On/off switch or outlet
    Switch,
    /// Thermostat
    Climate,
    /// Ventilation fan
    Fan,
    /// Momentary action such as a gas valve or an elevator call
    Button,
    /// Read-only measurement
    Sensor,
}

impl DeviceKind {
    /// Document value of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Light => "light",
            DeviceKind::Switch => "switch",
            DeviceKind::Climate => "climate",
            DeviceKind::Fan => "fan",
            DeviceKind::Button => "button",
            DeviceKind::Sensor => "sensor",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "light" => Ok(DeviceKind::Light),
            "switch" => Ok(DeviceKind::Switch),
            "climate" => Ok(DeviceKind::Climate),
            "fan" => Ok(DeviceKind::Fan),
            "button" => Ok(DeviceKind::Button),
            "sensor" => Ok(DeviceKind::Sensor),
            other => Err(ProtocolError::invalid_packet(format!("unknown device kind '{}'", other))),
        }
    }
}

/// How a data-carrying byte holds its number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    /// The byte is the number
    Binary,
    /// The byte holds the number's two decimal digits as nibbles (23 is `0x23`)
    Decimal,
}

impl DataEncoding {
    /// Document value of the encoding
    pub fn as_str(&self) -> &'static str {
        match self {
            DataEncoding::Binary => "binary",
            DataEncoding::Decimal => "decimal",
        }
    }

    /// Byte for a number, or `None` when the number does not fit
    pub fn encode(&self, value: i64) -> Option<u8> {
        match self {
            DataEncoding::Binary => u8::try_from(value).ok(),
            DataEncoding::Decimal => {
                if (0..=99).contains(&value) {
                    Some(((value / 10) as u8) << 4 | (value % 10) as u8)
                } else {
                    None
                }
            }
        }
    }

    /// Number held by a byte, or `None` when a decimal byte has a non-decimal nibble
    pub fn decode(&self, byte: u8) -> Option<i64> {
        match self {
            DataEncoding::Binary => Some(i64::from(byte)),
            DataEncoding::Decimal => {
                let (hi, lo) = (byte >> 4, byte & 0x0F);
                if hi > 9 || lo > 9 {
                    None
                } else {
                    Some(i64::from(hi) * 10 + i64::from(lo))
                }
            }
        }
    }
}

/// One byte position of a packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    /// Field name, e.g. `power` or `deviceId`
    pub name: String,
    /// Symbol to byte table, in document order
    #[serde(serialize_with = "serialize_values", skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<(String, u8)>,
    /// Free-form note
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Data encoding, when the byte carries a number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataEncoding>,
}

impl FieldSpec {
    /// A field with a name only
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            memo: None,
            data: None,
        }
    }

    /// Add a symbol to the value table
    pub fn with_value<S: Into<String>>(mut self, symbol: S, byte: u8) -> Self {
        self.values.push((symbol.into(), byte));
        self
    }

    /// Mark the field as carrying a number
    pub fn with_data(mut self, data: DataEncoding) -> Self {
        self.data = Some(data);
        self
    }

    /// Encoding used for numbers written to this field
    pub fn encoding(&self) -> DataEncoding {
        self.data.unwrap_or(DataEncoding::Binary)
    }

    /// Byte registered for a symbol
    pub fn byte_for(&self, symbol: &str) -> Option<u8> {
        self.values
            .iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, byte)| *byte)
    }

    /// Symbol registered for a byte
    pub fn symbol_for(&self, byte: u8) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, b)| *b == byte)
            .map(|(name, _)| name.as_str())
    }

    /// Whether the field is the fixed `00` filler
    pub fn is_empty(&self) -> bool {
        self.name == EMPTY_FIELD
    }

    /// Whether the field is the checksum
    pub fn is_checksum(&self) -> bool {
        self.name == CHECKSUM_FIELD
    }

    /// Filler, checksum and undecoded bytes carry no device meaning
    pub fn is_structural(&self) -> bool {
        self.is_empty() || self.is_checksum() || self.name == UNKNOWN_FIELD || self.name.is_empty()
    }
}

/// Shape of one packet type of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketSpec {
    /// Header byte
    #[serde(serialize_with = "serialize_hex")]
    pub header: u8,
    /// Fields by byte position (1 to 7)
    #[serde(rename = "structure")]
    pub fields: BTreeMap<u8, FieldSpec>,
}

impl PacketSpec {
    /// A packet type with no fields yet
    pub fn new(header: u8) -> Self {
        Self {
            header,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field at a position
    pub fn with_field(mut self, position: u8, field: FieldSpec) -> Self {
        self.fields.insert(position, field);
        self
    }

    /// Field at a byte position
    pub fn field_at(&self, position: u8) -> Option<&FieldSpec> {
        self.fields.get(&position)
    }

    /// Position and spec of a named field
    pub fn field(&self, name: &str) -> Option<(u8, &FieldSpec)> {
        self.fields
            .iter()
            .find(|(_, field)| field.name == name)
            .map(|(pos, field)| (*pos, field))
    }

    /// Position of the device number byte
    pub fn device_id_position(&self) -> Option<u8> {
        self.field(DEVICE_ID_FIELD).map(|(pos, _)| pos)
    }
}

/// Everything known about one device's packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStructure {
    /// Device name, e.g. `Thermo`
    pub name: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Packet shapes by type
    pub packets: BTreeMap<PacketType, PacketSpec>,
}

impl DeviceStructure {
    /// A device with no packet types yet
    pub fn new<S: Into<String>>(name: S, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            packets: BTreeMap::new(),
        }
    }

    /// Add a packet type
    pub fn with_packet(mut self, packet_type: PacketType, spec: PacketSpec) -> Self {
        self.packets.insert(packet_type, spec);
        self
    }

    /// Shape of a packet type
    pub fn packet(&self, packet_type: PacketType) -> Option<&PacketSpec> {
        self.packets.get(&packet_type)
    }

    /// Check the rules a single device must satisfy on its own
    pub fn validate(&self) -> std::result::Result<(), RegistryError> {
        for (packet_type, spec) in &self.packets {
            let mut seen: HashMap<&str, u8> = HashMap::new();
            for (position, field) in &spec.fields {
                if *position == 0 || usize::from(*position) > CHECKSUM_POS {
                    return Err(RegistryError::BadPosition {
                        device: self.name.clone(),
                        packet_type: *packet_type,
                        position: position.to_string(),
                    });
                }
                if usize::from(*position) == CHECKSUM_POS && !field.is_checksum() {
                    return Err(RegistryError::ChecksumPosition {
                        device: self.name.clone(),
                        packet_type: *packet_type,
                        name: field.name.clone(),
                    });
                }
                if !field.is_empty() && !field.name.is_empty() {
                    if let Some(first) = seen.insert(field.name.as_str(), *position) {
                        return Err(RegistryError::DuplicateField {
                            device: self.name.clone(),
                            packet_type: *packet_type,
                            name: field.name.clone(),
                            first,
                            second: *position,
                        });
                    }
                }
                for (i, (symbol, byte)) in field.values.iter().enumerate() {
                    if let Some((other, _)) = field.values[..i].iter().find(|(_, b)| b == byte) {
                        return Err(RegistryError::DuplicateValue {
                            device: self.name.clone(),
                            packet_type: *packet_type,
                            field: field.name.clone(),
                            first: other.clone(),
                            second: symbol.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Serialize for DeviceStructure {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.packets.len() + 1))?;
        map.serialize_entry("type", &self.kind)?;
        for (packet_type, spec) in &self.packets {
            map.serialize_entry(packet_type.as_str(), spec)?;
        }
        map.end()
    }
}

/// A whole vendor or override table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructureDocument {
    /// Devices in document order
    pub devices: Vec<DeviceStructure>,
}

impl Serialize for StructureDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.devices.len()))?;
        for device in &self.devices {
            map.serialize_entry(&device.name, device)?;
        }
        map.end()
    }
}

impl StructureDocument {
    /// Device by name
    pub fn device(&self, name: &str) -> Option<&DeviceStructure> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Parse a YAML document, checking each device on its own
    pub fn from_yaml_str(text: &str) -> std::result::Result<Self, RegistryError> {
        let docs = YamlLoader::load_from_str(text)
            .map_err(|e| RegistryError::Malformed(e.to_string()))?;

        let root = match docs.into_iter().next() {
            Some(root) => root,
            None => return Ok(Self::default()),
        };

        let hash = match root {
            Yaml::Hash(hash) => hash,
            Yaml::Null => return Ok(Self::default()),
            _ => {
                return Err(RegistryError::Malformed(
                    "top level must map device names to structures".to_string(),
                ))
            }
        };

        let mut devices = Vec::with_capacity(hash.len());
        for (key, value) in hash.iter() {
            let name = scalar_text(key).ok_or_else(|| {
                RegistryError::Malformed("device names must be plain scalars".to_string())
            })?;
            if devices.iter().any(|d: &DeviceStructure| d.name == name) {
                return Err(RegistryError::InvalidDevice {
                    device: name,
                    reason: "defined twice".to_string(),
                });
            }
            let device = parse_device(&name, value)?;
            device.validate()?;
            devices.push(device);
        }

        debug!("Parsed structure document with {} devices", devices.len());
        Ok(Self { devices })
    }

    /// Render the document as YAML
    pub fn to_yaml_string(&self) -> Result<String> {
        let mut root = Hash::new();
        for device in &self.devices {
            root.insert(Yaml::String(device.name.clone()), device_to_yaml(device));
        }

        let mut out = String::new();
        YamlEmitter::new(&mut out)
            .dump(&Yaml::Hash(root))
            .map_err(|e| ProtocolError::Serialization(format!("{:?}", e)))?;
        out.push('\n');
        Ok(out)
    }

    /// Render the document as JSON
    pub fn to_json_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Read a YAML document from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_yaml_str(&text)?)
    }

    /// Write the document to disk as YAML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path.as_ref(), self.to_yaml_string()?)?;
        Ok(())
    }
}

/// Parse one byte written as two hex digits
pub fn parse_hex_byte(text: &str) -> Option<u8> {
    match hex::decode(text.trim()).ok()?.as_slice() {
        [byte] => Some(*byte),
        _ => None,
    }
}

fn scalar_text(yaml: &Yaml) -> Option<String> {
    match yaml {
        Yaml::String(s) => Some(s.clone()),
        // Unquoted hex such as 82 or 04 arrives as an integer
        Yaml::Integer(i) => Some(format!("{:02}", i)),
        Yaml::Real(s) => Some(s.clone()),
        Yaml::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

fn get<'a>(hash: &'a Hash, key: &str) -> Option<&'a Yaml> {
    hash.get(&Yaml::String(key.to_string()))
}

fn invalid(device: &str, reason: String) -> RegistryError {
    RegistryError::InvalidDevice {
        device: device.to_string(),
        reason,
    }
}

fn parse_device(name: &str, yaml: &Yaml) -> std::result::Result<DeviceStructure, RegistryError> {
    let hash = match yaml {
        Yaml::Hash(hash) => hash,
        _ => return Err(invalid(name, "entry must be a mapping".to_string())),
    };

    let kind_text = get(hash, "type")
        .and_then(scalar_text)
        .ok_or_else(|| invalid(name, "missing 'type'".to_string()))?;
    let kind = DeviceKind::from_str(&kind_text)
        .map_err(|_| invalid(name, format!("unknown type '{}'", kind_text)))?;

    let mut device = DeviceStructure::new(name, kind);
    for (key, value) in hash.iter() {
        let key = scalar_text(key).unwrap_or_default();
        if key == "type" {
            continue;
        }
        let packet_type = PacketType::from_str(&key)
            .map_err(|_| invalid(name, format!("unexpected key '{}'", key)))?;
        let spec = parse_packet(name, packet_type, value)?;
        device.packets.insert(packet_type, spec);
    }
    Ok(device)
}

fn parse_packet(
    device: &str,
    packet_type: PacketType,
    yaml: &Yaml,
) -> std::result::Result<PacketSpec, RegistryError> {
    let hash = match yaml {
        Yaml::Hash(hash) => hash,
        _ => return Err(invalid(device, format!("{} must be a mapping", packet_type))),
    };

    let bad_hex = |text: String| RegistryError::BadHex {
        device: device.to_string(),
        packet_type,
        text,
    };

    let header_text = get(hash, "header")
        .and_then(scalar_text)
        .ok_or_else(|| invalid(device, format!("{} has no header", packet_type)))?;
    let header = parse_hex_byte(&header_text).ok_or_else(|| bad_hex(header_text.clone()))?;

    let mut spec = PacketSpec::new(header);
    let structure = match get(hash, "structure") {
        None | Some(Yaml::Null) => return Ok(spec),
        Some(Yaml::Hash(structure)) => structure,
        Some(_) => {
            return Err(invalid(
                device,
                format!("{} structure must be a mapping", packet_type),
            ))
        }
    };

    for (key, value) in structure.iter() {
        let position_text = scalar_text(key).unwrap_or_default();
        let position = position_text
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|p| (1..=CHECKSUM_POS as u8).contains(p))
            .ok_or_else(|| RegistryError::BadPosition {
                device: device.to_string(),
                packet_type,
                position: position_text.clone(),
            })?;
        let field = parse_field(device, packet_type, value, &bad_hex)?;
        spec.fields.insert(position, field);
    }
    Ok(spec)
}

fn parse_field(
    device: &str,
    packet_type: PacketType,
    yaml: &Yaml,
    bad_hex: &dyn Fn(String) -> RegistryError,
) -> std::result::Result<FieldSpec, RegistryError> {
    let hash = match yaml {
        Yaml::Hash(hash) => hash,
        _ => return Err(invalid(device, format!("{} fields must be mappings", packet_type))),
    };

    let name = get(hash, "name").and_then(scalar_text).unwrap_or_default();
    let mut field = FieldSpec::named(name);

    match get(hash, "values") {
        None | Some(Yaml::Null) => {}
        Some(Yaml::Hash(values)) => {
            for (symbol, byte) in values.iter() {
                let symbol = scalar_text(symbol).ok_or_else(|| {
                    invalid(device, format!("field '{}' has a bad symbol", field.name))
                })?;
                let text = scalar_text(byte).unwrap_or_default();
                let byte = parse_hex_byte(&text).ok_or_else(|| bad_hex(text.clone()))?;
                field.values.push((symbol, byte));
            }
        }
        Some(_) => {
            return Err(invalid(
                device,
                format!("values of field '{}' must be a mapping", field.name),
            ))
        }
    }

    field.memo = get(hash, "memo").and_then(scalar_text);

    if let Some(data) = get(hash, "data").and_then(scalar_text) {
        field.data = Some(match data.as_str() {
            "decimal" => DataEncoding::Decimal,
            "binary" => DataEncoding::Binary,
            other => {
                return Err(invalid(
                    device,
                    format!("field '{}' has unknown data encoding '{}'", field.name, other),
                ))
            }
        });
    }

    Ok(field)
}

fn device_to_yaml(device: &DeviceStructure) -> Yaml {
    let mut hash = Hash::new();
    hash.insert(
        Yaml::String("type".to_string()),
        Yaml::String(device.kind.as_str().to_string()),
    );
    for (packet_type, spec) in &device.packets {
        let mut packet = Hash::new();
        packet.insert(
            Yaml::String("header".to_string()),
            Yaml::String(hex_byte(spec.header)),
        );
        let mut structure = Hash::new();
        for (position, field) in &spec.fields {
            structure.insert(
                Yaml::String(position.to_string()),
                field_to_yaml(field),
            );
        }
        packet.insert(Yaml::String("structure".to_string()), Yaml::Hash(structure));
        hash.insert(
            Yaml::String(packet_type.as_str().to_string()),
            Yaml::Hash(packet),
        );
    }
    Yaml::Hash(hash)
}

fn field_to_yaml(field: &FieldSpec) -> Yaml {
    let mut hash = Hash::new();
    hash.insert(
        Yaml::String("name".to_string()),
        Yaml::String(field.name.clone()),
    );
    if !field.values.is_empty() {
        let mut values = Hash::new();
        for (symbol, byte) in &field.values {
            values.insert(Yaml::String(symbol.clone()), Yaml::String(hex_byte(*byte)));
        }
        hash.insert(Yaml::String("values".to_string()), Yaml::Hash(values));
    }
    if let Some(memo) = &field.memo {
        hash.insert(Yaml::String("memo".to_string()), Yaml::String(memo.clone()));
    }
    if let Some(data) = field.data {
        hash.insert(
            Yaml::String("data".to_string()),
            Yaml::String(data.as_str().to_string()),
        );
    }
    Yaml::Hash(hash)
}

fn serialize_hex<S: Serializer>(byte: &u8, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex_byte(*byte))
}

fn serialize_values<S: Serializer>(
    values: &[(String, u8)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(values.len()))?;
    for (symbol, byte) in values {
        map.serialize_entry(symbol, &hex_byte(*byte))?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    const THERMO: &str = r#"
Thermo:
  type: climate
  command:
    header: 04
    structure:
      1: {name: deviceId}
      2:
        name: commandType
        values: {power: 04, change: 03}
      3:
        name: value
        values: {'on': 81, 'off': 00}
        data: decimal
      4: {name: empty}
      5: {name: empty}
      6: {name: empty}
      7: {name: checksum}
  state:
    header: 82
    structure:
      1:
        name: power
        values: {'off': 80, idle: 81, heating: 83}
      2: {name: deviceId}
      3: {name: currentTemp, data: decimal, memo: room temperature}
      4: {name: targetTemp, data: decimal}
"#;

    #[test]
    fn test_parse_unquoted_hex() {
        let doc = StructureDocument::from_yaml_str(THERMO).unwrap();
        let thermo = doc.device("Thermo").unwrap();
        assert_eq!(thermo.kind, DeviceKind::Climate);

        let command = thermo.packet(PacketType::Command).unwrap();
        assert_eq!(command.header, 0x04);
        let (pos, value) = command.field("value").unwrap();
        assert_eq!(pos, 3);
        assert_eq!(value.byte_for("on"), Some(0x81));
        assert_eq!(value.byte_for("off"), Some(0x00));
        assert_eq!(value.encoding(), DataEncoding::Decimal);

        let state = thermo.packet(PacketType::State).unwrap();
        assert_eq!(state.header, 0x82);
        assert_eq!(state.device_id_position(), Some(2));
        assert_eq!(state.field_at(1).unwrap().symbol_for(0x83), Some("heating"));
        assert_eq!(state.field_at(3).unwrap().memo.as_deref(), Some("room temperature"));
        assert!(thermo.packet(PacketType::Ack).is_none());
    }

    #[test]
    fn test_yaml_round_trip() {
        let doc = StructureDocument::from_yaml_str(THERMO).unwrap();
        let emitted = doc.to_yaml_string().unwrap();
        let reparsed = StructureDocument::from_yaml_str(&emitted).unwrap();
        assert_eq!(doc, reparsed);
        assert!(emitted.contains("data: decimal"));
    }

    #[test]
    fn test_json_shape() {
        let doc = StructureDocument::from_yaml_str(THERMO).unwrap();
        let json = doc.to_json_value().unwrap();
        assert_eq!(json["Thermo"]["type"], "climate");
        assert_eq!(json["Thermo"]["state"]["header"], "82");
        assert_eq!(json["Thermo"]["state"]["structure"]["1"]["values"]["heating"], "83");
        assert!(json["Thermo"]["state"]["structure"]["2"].get("values").is_none());
    }

    #[test]
    fn test_rejects_bad_header() {
        let text = "Light:\n  type: light\n  state:\n    header: B\n";
        assert!(matches!(
            StructureDocument::from_yaml_str(text),
            Err(RegistryError::BadHex { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_position() {
        let text = "Light:\n  type: light\n  state:\n    header: B0\n    structure:\n      8: {name: power}\n";
        assert!(matches!(
            StructureDocument::from_yaml_str(text),
            Err(RegistryError::BadPosition { .. })
        ));
    }

    #[test]
    fn test_rejects_field_at_checksum_position() {
        let text = "Light:\n  type: light\n  state:\n    header: B0\n    structure:\n      7: {name: power}\n";
        assert!(matches!(
            StructureDocument::from_yaml_str(text),
            Err(RegistryError::ChecksumPosition { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_field_names() {
        let text = r#"
Light:
  type: light
  state:
    header: B0
    structure:
      1: {name: power}
      2: {name: power}
      3: {name: empty}
      4: {name: empty}
"#;
        match StructureDocument::from_yaml_str(text) {
            Err(RegistryError::DuplicateField { first, second, .. }) => {
                assert_eq!((first, second), (1, 2));
            }
            other => panic!("expected duplicate field, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_duplicate_value_bytes() {
        let text = r#"
Light:
  type: light
  state:
    header: B0
    structure:
      1: {name: power, values: {'on': '01', lit: '01'}}
"#;
        assert!(matches!(
            StructureDocument::from_yaml_str(text),
            Err(RegistryError::DuplicateValue { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_kind_and_key() {
        let text = "Light:\n  type: lamp\n";
        assert!(matches!(
            StructureDocument::from_yaml_str(text),
            Err(RegistryError::InvalidDevice { .. })
        ));
        let text = "Light:\n  type: light\n  status:\n    header: B0\n";
        assert!(matches!(
            StructureDocument::from_yaml_str(text),
            Err(RegistryError::InvalidDevice { .. })
        ));
    }

    #[test]
    fn test_empty_document() {
        assert!(StructureDocument::from_yaml_str("").unwrap().devices.is_empty());
        assert!(StructureDocument::from_yaml_str("- a\n- b\n").is_err());
    }

    #[test]
    fn test_decimal_encoding() {
        assert_eq!(DataEncoding::Decimal.encode(23), Some(0x23));
        assert_eq!(DataEncoding::Decimal.encode(5), Some(0x05));
        assert_eq!(DataEncoding::Decimal.encode(100), None);
        assert_eq!(DataEncoding::Decimal.decode(0x40), Some(40));
        assert_eq!(DataEncoding::Decimal.decode(0x2A), None);
        assert_eq!(DataEncoding::Binary.encode(255), Some(0xFF));
        assert_eq!(DataEncoding::Binary.encode(-1), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("custom.yaml");
        let doc = StructureDocument::from_yaml_str(THERMO).unwrap();
        doc.save(&path).unwrap();
        assert_eq!(StructureDocument::load(&path).unwrap(), doc);
    }
}
