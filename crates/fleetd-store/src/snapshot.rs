// ABOUTME: RegistrySnapshot, the unit of durability for the device registry.
// ABOUTME: Holds the ordered device list, the default device id, the global mode, and a timestamp.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleetd_core::{DeviceRecord, Mode};
use serde::{Deserialize, Serialize};

/// The full durable serialization of the registry at a point in time.
/// Loaded once at startup and replaced wholesale on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// `(id, record)` pairs in ascending id order.
    pub devices: Vec<(String, DeviceRecord)>,
    pub default_device: Option<String>,
    /// Absent in snapshots written before the mode was recorded.
    #[serde(default)]
    pub mode: Option<Mode>,
    pub last_updated: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// An empty registry: no devices, no default, stamped now.
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            default_device: None,
            mode: None,
            last_updated: Utc::now(),
        }
    }

    pub fn from_map(
        devices: &BTreeMap<String, DeviceRecord>,
        default_device: Option<&str>,
        mode: Mode,
    ) -> Self {
        Self {
            devices: devices
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
            default_device: default_device.map(str::to_string),
            mode: Some(mode),
            last_updated: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device_map(&self) -> BTreeMap<String, DeviceRecord> {
        self.devices.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_core::{DeviceState, FeatureDescriptor, PricingProfile};

    fn make_record(id: &str) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            device_type: "buzzer".to_string(),
            features: vec![FeatureDescriptor::stable("vibrate")],
            pricing: PricingProfile::default(),
            state: DeviceState::Initialized,
            mode: Mode::Development,
            is_default: id == "a",
        }
    }

    #[test]
    fn from_map_keeps_id_order() {
        let mut map = BTreeMap::new();
        map.insert("c".to_string(), make_record("c"));
        map.insert("a".to_string(), make_record("a"));
        map.insert("b".to_string(), make_record("b"));

        let snapshot = RegistrySnapshot::from_map(&map, Some("a"), Mode::Development);
        let ids: Vec<_> = snapshot.devices.iter().map(|(id, _)| id.as_str()).collect();

        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(snapshot.default_device.as_deref(), Some("a"));
        assert_eq!(snapshot.device_map(), map);
    }

    #[test]
    fn snapshot_without_mode_field_still_parses() {
        let json = r#"{"devices":[],"default_device":null,"last_updated":"2024-01-01T00:00:00Z"}"#;
        let snapshot: RegistrySnapshot = serde_json::from_str(json).unwrap();

        assert!(snapshot.is_empty());
        assert!(snapshot.mode.is_none());
    }
}
