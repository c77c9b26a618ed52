/*!
 * Packet structure registry.
 *
 * The registry is the merged, validated view of a vendor table and the
 * user's override table. It is immutable once built; reloading the override
 * builds a new registry and swaps it in through [`SharedRegistry`].
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use wallpad_core::config::GatewayConfig;

use crate::error::{ProtocolError, RegistryError, Result};
use crate::structure::{DeviceStructure, FieldSpec, PacketSpec, PacketType, StructureDocument};

/// Built-in Commax table
const COMMAX_TABLE: &str = include_str!("../tables/commax.yaml");

/// Vendor name meaning "use the override table alone"
pub const CUSTOM_VENDOR: &str = "custom";

/// Order in which packet types are tried when a header is shared between types
pub const DECODE_PRIORITY: [PacketType; 4] = [
    PacketType::State,
    PacketType::Ack,
    PacketType::Command,
    PacketType::StateRequest,
];

/// Merged, validated packet structures
#[derive(Debug, Clone)]
pub struct Registry {
    document: StructureDocument,
    headers: HashMap<(PacketType, u8), usize>,
}

impl Registry {
    /// Built-in table for a vendor
    pub fn builtin(vendor: &str) -> std::result::Result<StructureDocument, RegistryError> {
        match vendor.to_ascii_lowercase().as_str() {
            "commax" => StructureDocument::from_yaml_str(COMMAX_TABLE),
            other => Err(RegistryError::UnknownVendor(other.to_string())),
        }
    }

    /// Merge an override table over a vendor table and validate the result
    ///
    /// Merging is per device: a device named in the override replaces the
    /// vendor's device of that name as a whole.
    pub fn load(
        vendor: StructureDocument,
        overrides: Option<StructureDocument>,
    ) -> std::result::Result<Self, RegistryError> {
        let mut merged = vendor;
        if let Some(overrides) = overrides {
            for device in overrides.devices {
                match merged.devices.iter_mut().find(|d| d.name == device.name) {
                    Some(slot) => {
                        debug!("Override replaces device {}", device.name);
                        *slot = device;
                    }
                    None => {
                        debug!("Override adds device {}", device.name);
                        merged.devices.push(device);
                    }
                }
            }
        }
        Self::from_document(merged)
    }

    /// Validate a single document
    pub fn from_document(document: StructureDocument) -> std::result::Result<Self, RegistryError> {
        let mut headers: HashMap<(PacketType, u8), usize> = HashMap::new();

        for (index, device) in document.devices.iter().enumerate() {
            device.validate()?;
            for (packet_type, spec) in &device.packets {
                if let Some(other) = headers.insert((*packet_type, spec.header), index) {
                    return Err(RegistryError::DuplicateHeader {
                        packet_type: *packet_type,
                        header: spec.header,
                        first: document.devices[other].name.clone(),
                        second: device.name.clone(),
                    });
                }
            }
        }

        Ok(Self { document, headers })
    }

    /// Build the registry the configuration asks for
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let general = &config.general;
        let override_path = config.override_table_path();

        let overrides = if override_path.exists() {
            info!("Loading override table {}", override_path.display());
            Some(StructureDocument::load(&override_path)?)
        } else {
            None
        };

        if general.vendor.eq_ignore_ascii_case(CUSTOM_VENDOR) {
            let document = overrides.ok_or_else(|| {
                RegistryError::Malformed(format!(
                    "vendor is '{}' but {} does not exist",
                    CUSTOM_VENDOR,
                    override_path.display()
                ))
            })?;
            return Ok(Self::from_document(document)?);
        }

        let vendor = match &general.vendor_table {
            Some(path) => {
                info!("Loading vendor table {}", path);
                StructureDocument::load(path)?
            }
            None => Self::builtin(&general.vendor)?,
        };

        let registry = Self::load(vendor, overrides)?;
        info!(
            "Packet registry ready for vendor {} with {} devices",
            general.vendor,
            registry.document.devices.len()
        );
        Ok(registry)
    }

    /// Device and packet shape registered under a header for one packet type
    pub fn lookup(&self, packet_type: PacketType, header: u8) -> Option<(&DeviceStructure, &PacketSpec)> {
        let index = self.headers.get(&(packet_type, header))?;
        let device = &self.document.devices[*index];
        device.packet(packet_type).map(|spec| (device, spec))
    }

    /// Packet type a received header most likely belongs to
    pub fn classify(&self, header: u8) -> Option<(&DeviceStructure, PacketType, &PacketSpec)> {
        DECODE_PRIORITY.iter().find_map(|packet_type| {
            self.lookup(*packet_type, header)
                .map(|(device, spec)| (device, *packet_type, spec))
        })
    }

    /// Device by name
    pub fn device(&self, name: &str) -> Result<&DeviceStructure> {
        self.document
            .device(name)
            .ok_or_else(|| ProtocolError::unknown_device(name))
    }

    /// Packet shape of a device, failing when either is missing
    pub fn packet(&self, device: &str, packet_type: PacketType) -> Result<&PacketSpec> {
        self.device(device)?
            .packet(packet_type)
            .ok_or_else(|| ProtocolError::MissingPacketType {
                device: device.to_string(),
                packet_type,
            })
    }

    /// Fields of a device's packet type in byte order
    pub fn fields_for(&self, device: &str, packet_type: PacketType) -> Result<Vec<(u8, &FieldSpec)>> {
        Ok(self
            .packet(device, packet_type)?
            .fields
            .iter()
            .map(|(pos, field)| (*pos, field))
            .collect())
    }

    /// Registered devices in document order
    pub fn devices(&self) -> impl Iterator<Item = &DeviceStructure> {
        self.document.devices.iter()
    }

    /// The merged document
    pub fn document(&self) -> &StructureDocument {
        &self.document
    }
}

/// A registry that can be swapped while readers hold the previous one
#[derive(Debug, Clone)]
pub struct SharedRegistry(Arc<RwLock<Arc<Registry>>>);

impl SharedRegistry {
    /// Wrap a registry
    pub fn new(registry: Registry) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(registry))))
    }

    /// The current registry; it stays valid even if a swap happens afterwards
    pub fn snapshot(&self) -> Result<Arc<Registry>> {
        let guard = self.0.read().map_err(|_| {
            ProtocolError::Registry(RegistryError::Malformed(
                "Failed to acquire read lock on packet registry".to_string(),
            ))
        })?;
        Ok(Arc::clone(&guard))
    }

    /// Replace the registry as a whole
    pub fn replace(&self, registry: Registry) -> Result<()> {
        let mut guard = self.0.write().map_err(|_| {
            ProtocolError::Registry(RegistryError::Malformed(
                "Failed to acquire write lock on packet registry".to_string(),
            ))
        })?;
        *guard = Arc::new(registry);
        info!("Packet registry replaced");
        Ok(())
    }

    /// Rebuild from configuration and swap; the old registry stays on failure
    pub fn reload(&self, config: &GatewayConfig) -> Result<()> {
        match Registry::from_config(config) {
            Ok(registry) => self.replace(registry),
            Err(e) => {
                warn!("Keeping previous packet registry: {}", e);
                Err(e)
            }
        }
    }
}

impl From<Registry> for SharedRegistry {
    fn from(registry: Registry) -> Self {
        Self::new(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::{DeviceKind, FieldSpec};

    fn commax() -> Registry {
        Registry::load(Registry::builtin("commax").unwrap(), None).unwrap()
    }

    #[test]
    fn test_builtin_table_loads() {
        let registry = commax();
        let names: Vec<&str> = registry.devices().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Light", "LightBreaker", "Thermo", "Fan", "Outlet", "Gas", "EV"]
        );
        assert!(matches!(
            Registry::builtin("kocom"),
            Err(RegistryError::UnknownVendor(_))
        ));
    }

    #[test]
    fn test_lookup_by_type_and_header() {
        let registry = commax();
        let (device, spec) = registry.lookup(PacketType::State, 0x82).unwrap();
        assert_eq!(device.name, "Thermo");
        assert_eq!(spec.header, 0x82);
        assert!(registry.lookup(PacketType::Command, 0x82).is_none());
        assert!(registry.lookup(PacketType::State, 0x55).is_none());

        let (device, packet_type, _) = registry.classify(0x02).unwrap();
        assert_eq!((device.name.as_str(), packet_type), ("Thermo", PacketType::StateRequest));
    }

    #[test]
    fn test_fields_for_in_byte_order() {
        let registry = commax();
        let fields = registry.fields_for("Thermo", PacketType::State).unwrap();
        let names: Vec<(u8, &str)> = fields.iter().map(|(p, f)| (*p, f.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (1, "power"),
                (2, "deviceId"),
                (3, "currentTemp"),
                (4, "targetTemp"),
                (5, "empty"),
                (6, "empty"),
                (7, "checksum"),
            ]
        );
        assert!(matches!(
            registry.fields_for("Boiler", PacketType::State),
            Err(ProtocolError::UnknownDevice(_))
        ));
        assert!(matches!(
            registry.fields_for("Gas", PacketType::Ack),
            Err(ProtocolError::MissingPacketType { .. })
        ));
    }

    #[test]
    fn test_duplicate_header_is_rejected() {
        let mut document = Registry::builtin("commax").unwrap();
        document.devices.push(
            DeviceStructure::new("Boiler", DeviceKind::Climate)
                .with_packet(PacketType::State, PacketSpec::new(0x82)),
        );
        match Registry::from_document(document) {
            Err(RegistryError::DuplicateHeader { header, first, second, .. }) => {
                assert_eq!(header, 0x82);
                assert_eq!(first, "Thermo");
                assert_eq!(second, "Boiler");
            }
            other => panic!("expected duplicate header, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_same_header_in_different_types_is_allowed() {
        let document = StructureDocument {
            devices: vec![
                DeviceStructure::new("A", DeviceKind::Light)
                    .with_packet(PacketType::State, PacketSpec::new(0x10)),
                DeviceStructure::new("B", DeviceKind::Light)
                    .with_packet(PacketType::Command, PacketSpec::new(0x10)),
            ],
        };
        let registry = Registry::from_document(document).unwrap();
        let (device, packet_type, _) = registry.classify(0x10).unwrap();
        assert_eq!((device.name.as_str(), packet_type), ("A", PacketType::State));
    }

    #[test]
    fn test_override_replaces_whole_device() {
        let overrides = StructureDocument::from_yaml_str(
            r#"
Light:
  type: light
  state:
    header: C0
    structure:
      '1': {name: power, values: {'on': '05', 'off': '06'}}
      '3': {name: deviceId}
Heater:
  type: switch
  state:
    header: C8
"#,
        )
        .unwrap();

        let registry = Registry::load(Registry::builtin("commax").unwrap(), Some(overrides)).unwrap();
        let light = registry.device("Light").unwrap();
        assert!(light.packet(PacketType::Command).is_none());
        assert!(light.packet(PacketType::Ack).is_none());
        assert_eq!(light.packet(PacketType::State).unwrap().device_id_position(), Some(3));
        assert!(registry.lookup(PacketType::State, 0xB0).is_none());
        assert_eq!(registry.lookup(PacketType::State, 0xC0).unwrap().0.name, "Light");
        assert_eq!(registry.devices().last().unwrap().name, "Heater");
        assert_eq!(registry.devices().next().unwrap().name, "Light");
    }

    #[test]
    fn test_override_can_introduce_collision() {
        let overrides = StructureDocument {
            devices: vec![DeviceStructure::new("Heater", DeviceKind::Switch)
                .with_packet(PacketType::State, PacketSpec::new(0xB0))],
        };
        assert!(Registry::load(Registry::builtin("commax").unwrap(), Some(overrides)).is_err());
    }

    #[test_log::test]
    fn test_from_config_custom_vendor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.general.data_dir = dir.path().to_string_lossy().to_string();
        config.general.vendor = CUSTOM_VENDOR.to_string();
        assert!(Registry::from_config(&config).is_err());

        let custom = StructureDocument {
            devices: vec![DeviceStructure::new("Heater", DeviceKind::Switch).with_packet(
                PacketType::State,
                PacketSpec::new(0xC8).with_field(1, FieldSpec::named("power")),
            )],
        };
        custom.save(config.override_table_path()).unwrap();
        let registry = Registry::from_config(&config).unwrap();
        assert_eq!(registry.devices().count(), 1);

        config.general.vendor = "commax".to_string();
        let registry = Registry::from_config(&config).unwrap();
        assert_eq!(registry.devices().count(), 8);
    }

    #[test]
    fn test_shared_registry_swap_keeps_old_snapshot() {
        let shared = SharedRegistry::new(commax());
        let before = shared.snapshot().unwrap();

        let replacement = Registry::from_document(StructureDocument::default()).unwrap();
        shared.replace(replacement).unwrap();

        assert_eq!(before.devices().count(), 7);
        assert_eq!(shared.snapshot().unwrap().devices().count(), 0);
    }
}
