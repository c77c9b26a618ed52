/*!
 * Device discovery for the wallpad bus.
 *
 * The wallpad reports the state of every installed device on its own. A
 * scan listens to that traffic for a while and records, per device type,
 * the highest device number seen; the result is saved so later starts can
 * skip the scan.
 */
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::Decoded;
use crate::error::Result;
use crate::structure::{DeviceKind, PacketType};

/// How many instances of one device type are installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    /// Device kind
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Highest device number observed
    pub count: u8,
}

/// Scan result keyed by device name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FoundDevices(BTreeMap<String, FoundDevice>);

impl FoundDevices {
    /// Record a device directly
    pub fn insert<S: Into<String>>(&mut self, name: S, device: FoundDevice) {
        self.0.insert(name.into(), device);
    }

    /// Entry for a device name
    pub fn get(&self, name: &str) -> Option<&FoundDevice> {
        self.0.get(name)
    }

    /// Entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FoundDevice)> {
        self.0.iter()
    }

    /// Whether nothing was found
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of device types found
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Read a saved scan; `None` when no scan was saved yet
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        let found: FoundDevices = serde_json::from_str(&text)?;
        debug!("Loaded {} device types from {}", found.len(), path.display());
        Ok(Some(found))
    }

    /// Save the scan as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Saved device list to {}", path.display());
        Ok(())
    }
}

/// Accumulates state packets during a scan
#[derive(Debug, Default)]
pub struct DeviceScan {
    found: BTreeMap<String, FoundDevice>,
    observed: usize,
}

impl DeviceScan {
    /// Start an empty scan
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one classified frame into account; only state packets count
    pub fn observe(&mut self, decoded: &Decoded) {
        let known = match decoded.known() {
            Some(known) if known.packet_type == PacketType::State => known,
            _ => return,
        };
        let id = match known.device_id {
            Some(id) if id > 0 => id,
            _ => return,
        };

        self.observed += 1;
        let entry = self.found.entry(known.device.clone()).or_insert(FoundDevice {
            kind: known.kind,
            count: 0,
        });
        if id > entry.count {
            debug!(device = %known.device, id, "Found device");
            entry.count = id;
        }
    }

    /// Number of state packets that counted
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Finish the scan
    pub fn finish(self) -> FoundDevices {
        for (name, device) in &self.found {
            info!(device = %name, kind = %device.kind, count = device.count, "Scan result");
        }
        FoundDevices(self.found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, CodecOptions};
    use crate::packet::parse_hex;
    use crate::registry::Registry;
    use std::sync::Arc;

    fn codec() -> Codec {
        let registry = Registry::load(Registry::builtin("commax").unwrap(), None).unwrap();
        Codec::new(Arc::new(registry), CodecOptions::default())
    }

    #[test]
    fn test_scan_keeps_highest_id() {
        let codec = codec();
        let mut scan = DeviceScan::new();
        // Light 1, Light 3, Light 2, Thermo 1, a Light command, and noise
        let traffic = parse_hex(
            "B0010100000000B2 B0000300000000B3 B0010200000000B3 \
             8281012222000048 3101010000000033 55010000000000FF",
        )
        .unwrap();
        for decoded in codec.decode_stream(&traffic) {
            scan.observe(&decoded);
        }
        assert_eq!(scan.observed(), 4);

        let found = scan.finish();
        assert_eq!(found.len(), 2);
        assert_eq!(
            found.get("Light"),
            Some(&FoundDevice {
                kind: DeviceKind::Light,
                count: 3
            })
        );
        assert_eq!(found.get("Thermo").unwrap().count, 1);
        assert!(found.get("Fan").is_none());
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("found_devices.json");
        assert!(FoundDevices::load(&path)?.is_none());

        let mut found = FoundDevices::default();
        found.insert(
            "Fan",
            FoundDevice {
                kind: DeviceKind::Fan,
                count: 1,
            },
        );
        found.save(&path)?;

        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains("\"type\": \"fan\""));
        assert_eq!(FoundDevices::load(&path)?, Some(found));
        Ok(())
    }
}
