// ABOUTME: Domain events emitted by the device registry after each committed mutation.
// ABOUTME: Events carry the affected device id and, where applicable, the full updated record.

use serde::{Deserialize, Serialize};

use crate::model::{DeviceRecord, Mode};

/// Something that happened to the registry. Emitted synchronously from within
/// the operation that caused it, only after the change has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RegistryEvent {
    DeviceAdded { record: DeviceRecord },
    DeviceDeleted { device_id: String },
    DevicePromoted { record: DeviceRecord },
    ModeChanged { mode: Mode },
}

impl RegistryEvent {
    /// The device this event concerns, if any. Mode changes apply to the whole fleet.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            RegistryEvent::DeviceAdded { record } | RegistryEvent::DevicePromoted { record } => {
                Some(&record.id)
            }
            RegistryEvent::DeviceDeleted { device_id } => Some(device_id),
            RegistryEvent::ModeChanged { .. } => None,
        }
    }
}
