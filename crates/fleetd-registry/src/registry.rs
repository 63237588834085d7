// ABOUTME: DeviceRegistry, the in-memory authoritative map of device records, default pointer, and global mode.
// ABOUTME: Mutations build the next state, persist it under the storage lock, then swap it in and emit events.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetd_core::{
    AuditSink, DeviceConfigProvider, DeviceFilter, DeviceRecord, DeviceState, FeatureDescriptor,
    Mode, PricingProfile, RegistryEvent, resolve_features, resolve_pricing,
};
use fleetd_store::{PersistenceError, PersistenceManager, RegistrySnapshot};
use serde_json::json;
use tokio::sync::broadcast;

use crate::error::RegistryError;
use crate::operation::{
    ADD_DEVICE, AllowAll, DELETE_DEVICE, OperationPolicy, PROMOTE_DEVICE, SET_MODE, is_known,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Caller-supplied part of a new device record. Features, pricing, state,
/// mode, and the default flag are filled in by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub id: String,
    pub device_type: String,
}

impl NewDevice {
    pub fn new(id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
        }
    }
}

/// The fleet's device registry.
///
/// Invariant: when non-empty, exactly one record has `is_default = true` and
/// its id equals `default_device`; when empty, `default_device` is `None`.
/// The in-memory map is only replaced after the matching snapshot write has
/// succeeded, so a failed operation leaves the registry untouched.
///
/// Each instance remembers the `last_updated` stamp of the snapshot it loaded
/// or last wrote. A commit that finds a different stamp in storage fails with
/// `Stale` instead of overwriting another instance's writes.
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceRecord>,
    default_device: Option<String>,
    mode: Mode,
    persistence: PersistenceManager,
    stored_at: Option<DateTime<Utc>>,
    config: Arc<dyn DeviceConfigProvider>,
    audit: Arc<dyn AuditSink>,
    policy: Arc<dyn OperationPolicy>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Load the registry from storage. `initial_mode` applies only when the
    /// stored snapshot does not record a mode. Fails with `StateLoad` if the
    /// snapshot exists but cannot be read; no partially loaded registry is returned.
    pub fn open(
        persistence: PersistenceManager,
        config: Arc<dyn DeviceConfigProvider>,
        audit: Arc<dyn AuditSink>,
        initial_mode: Mode,
    ) -> Result<Self, RegistryError> {
        let stored = persistence
            .load_stored()
            .map_err(RegistryError::StateLoad)?;
        let stored_at = stored.as_ref().map(|snapshot| snapshot.last_updated);
        let snapshot = stored.unwrap_or_else(RegistrySnapshot::empty);

        let mode = snapshot.mode.unwrap_or(initial_mode);
        let mut devices = snapshot.device_map();
        let default_device = reconcile_default(&mut devices, snapshot.default_device);

        tracing::info!(
            "device registry opened with {} devices in {} mode (default: {})",
            devices.len(),
            mode,
            default_device.as_deref().unwrap_or("none")
        );

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            devices,
            default_device,
            mode,
            persistence,
            stored_at,
            config,
            audit,
            policy: Arc::new(AllowAll),
            event_tx,
        })
    }

    /// Replace the authorization policy consulted in production mode.
    pub fn with_policy(mut self, policy: Arc<dyn OperationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Subscribe to registry events. Events are sent synchronously from within
    /// the operation that caused them.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get_device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn default_device(&self) -> Option<&DeviceRecord> {
        self.default_device
            .as_deref()
            .and_then(|id| self.devices.get(id))
    }

    /// Records matching `filter`, in ascending id order. Pure read, no lock.
    pub fn list_devices(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.devices
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// Gate for every mutating operation: unknown names are rejected, and in
    /// production mode the configured policy must authorize the operation.
    pub fn validate_operation(&self, operation: &str) -> Result<(), RegistryError> {
        if !is_known(operation) {
            return Err(RegistryError::InvalidOperation(operation.to_string()));
        }
        if self.mode == Mode::Production && !self.policy.authorize(operation, self.mode) {
            return Err(RegistryError::Unauthorized {
                operation: operation.to_string(),
                mode: self.mode,
            });
        }
        Ok(())
    }

    /// Features configured for `device_type` as visible in the current mode.
    pub fn get_available_features(
        &self,
        device_type: &str,
    ) -> Result<Vec<FeatureDescriptor>, RegistryError> {
        let config = self.config.device_config(device_type)?;
        Ok(resolve_features(&config.features, self.mode))
    }

    /// Pricing for `device_type` as it applies in the current mode.
    pub fn get_pricing(&self, device_type: &str) -> Result<PricingProfile, RegistryError> {
        let config = self.config.device_config(device_type)?;
        Ok(resolve_pricing(&config.pricing, self.mode))
    }

    /// Register a new device. The first device added to an empty registry
    /// becomes the default and a `DevicePromoted` event follows `DeviceAdded`.
    pub fn add_device(&mut self, device: NewDevice) -> Result<DeviceRecord, RegistryError> {
        let result = self.try_add_device(&device);
        self.audit_failure(ADD_DEVICE, Some(&device.id), result)
    }

    /// Remove a device. If it was the default, the remaining device with the
    /// lowest id is promoted. Returns the removed record.
    pub fn delete_device(&mut self, id: &str) -> Result<DeviceRecord, RegistryError> {
        let result = self.try_delete_device(id);
        self.audit_failure(DELETE_DEVICE, Some(id), result)
    }

    /// Make `id` the default device. Promoting the current default is a
    /// no-op: nothing is written and no event is emitted.
    pub fn promote_device(&mut self, id: &str) -> Result<DeviceRecord, RegistryError> {
        let result = self.try_promote_device(id);
        self.audit_failure(PROMOTE_DEVICE, Some(id), result)
    }

    /// Switch the global mode and re-resolve every record's features and
    /// pricing, persisting the whole batch once. No-op if `mode` is current.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), RegistryError> {
        let result = self.try_set_mode(mode);
        self.audit_failure(SET_MODE, None, result)
    }

    fn try_add_device(&mut self, device: &NewDevice) -> Result<DeviceRecord, RegistryError> {
        self.validate_operation(ADD_DEVICE)?;

        if self.devices.contains_key(&device.id) {
            return Err(RegistryError::DuplicateDevice(device.id.clone()));
        }

        let first = self.devices.is_empty();
        let record = self.resolve_record(&device.id, &device.device_type, self.mode, first)?;

        let mut devices = self.devices.clone();
        devices.insert(record.id.clone(), record.clone());
        let default_device = if first {
            Some(record.id.clone())
        } else {
            self.default_device.clone()
        };

        self.commit(devices, default_device, self.mode)?;

        tracing::info!("added device {} ({})", record.id, record.device_type);
        self.audit_record(
            ADD_DEVICE,
            &record.id,
            json!({ "type": record.device_type, "mode": record.mode }),
        );

        self.emit(RegistryEvent::DeviceAdded {
            record: record.clone(),
        });
        if first {
            self.emit(RegistryEvent::DevicePromoted {
                record: record.clone(),
            });
        }

        Ok(record)
    }

    fn try_delete_device(&mut self, id: &str) -> Result<DeviceRecord, RegistryError> {
        self.validate_operation(DELETE_DEVICE)?;

        let removed = self
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;

        let mut devices = self.devices.clone();
        devices.remove(id);

        let mut promoted = None;
        let default_device = if removed.is_default {
            // BTreeMap iteration gives the lowest remaining id.
            match devices.values_mut().next() {
                Some(next) => {
                    next.is_default = true;
                    promoted = Some(next.clone());
                    Some(next.id.clone())
                }
                None => None,
            }
        } else {
            self.default_device.clone()
        };

        self.commit(devices, default_device, self.mode)?;

        tracing::info!("deleted device {}", id);
        self.audit_record(
            DELETE_DEVICE,
            id,
            json!({ "promoted": promoted.as_ref().map(|r| r.id.clone()) }),
        );

        if let Some(record) = promoted {
            tracing::info!("promoted device {} to default", record.id);
            self.emit(RegistryEvent::DevicePromoted { record });
        }
        self.emit(RegistryEvent::DeviceDeleted {
            device_id: id.to_string(),
        });

        Ok(removed)
    }

    fn try_promote_device(&mut self, id: &str) -> Result<DeviceRecord, RegistryError> {
        self.validate_operation(PROMOTE_DEVICE)?;

        let target = self
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::DeviceNotFound(id.to_string()))?;

        if target.is_default {
            tracing::debug!("device {} is already the default", id);
            return Ok(target);
        }

        let mut devices = self.devices.clone();
        let previous = self.default_device.clone();
        if let Some(prev) = previous.as_deref().and_then(|p| devices.get_mut(p)) {
            prev.is_default = false;
        }
        let mut promoted = target;
        promoted.is_default = true;
        devices.insert(promoted.id.clone(), promoted.clone());

        self.commit(devices, Some(promoted.id.clone()), self.mode)?;

        tracing::info!("promoted device {} to default", promoted.id);
        self.audit_record(PROMOTE_DEVICE, &promoted.id, json!({ "previous": previous }));

        self.emit(RegistryEvent::DevicePromoted {
            record: promoted.clone(),
        });

        Ok(promoted)
    }

    fn try_set_mode(&mut self, mode: Mode) -> Result<(), RegistryError> {
        self.validate_operation(SET_MODE)?;

        if mode == self.mode {
            return Ok(());
        }

        let mut devices = BTreeMap::new();
        for (id, record) in &self.devices {
            let resolved = self.resolve_record(id, &record.device_type, mode, record.is_default)?;
            devices.insert(id.clone(), resolved);
        }

        self.commit(devices, self.default_device.clone(), mode)?;

        tracing::info!("registry mode changed to {}", mode);
        if let Err(e) = self.audit.record_mode_change(mode) {
            tracing::warn!("audit sink failed to record mode change: {}", e);
        }

        self.emit(RegistryEvent::ModeChanged { mode });

        Ok(())
    }

    /// Build a record for `device_type` with features and pricing resolved for `mode`.
    fn resolve_record(
        &self,
        id: &str,
        device_type: &str,
        mode: Mode,
        is_default: bool,
    ) -> Result<DeviceRecord, RegistryError> {
        let config = self.config.device_config(device_type)?;
        Ok(DeviceRecord {
            id: id.to_string(),
            device_type: device_type.to_string(),
            features: resolve_features(&config.features, mode),
            pricing: resolve_pricing(&config.pricing, mode),
            state: DeviceState::Initialized,
            mode,
            is_default,
        })
    }

    /// Persist the next state under the storage lock, then adopt it in memory.
    fn commit(
        &mut self,
        devices: BTreeMap<String, DeviceRecord>,
        default_device: Option<String>,
        mode: Mode,
    ) -> Result<(), RegistryError> {
        let persistence = &self.persistence;
        let expected = self.stored_at;
        let written = persistence.run_exclusive(|| -> Result<_, PersistenceError> {
            persistence.ensure_unchanged(expected)?;
            persistence.save_snapshot(&devices, default_device.as_deref(), mode)
        })?;

        self.stored_at = Some(written);
        self.devices = devices;
        self.default_device = default_device;
        self.mode = mode;
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        // No active subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn audit_record(&self, operation: &str, device_id: &str, metadata: serde_json::Value) {
        if let Err(e) = self.audit.record(operation, device_id, Some(metadata)) {
            tracing::warn!("audit sink failed to record {} on {}: {}", operation, device_id, e);
        }
    }

    fn audit_failure<T>(
        &self,
        operation: &str,
        device_id: Option<&str>,
        result: Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        if let Err(err) = &result {
            tracing::debug!("{} failed: {}", operation, err);
            let metadata = json!({ "device_id": device_id, "retryable": err.is_retryable() });
            if let Err(e) =
                self.audit
                    .record_error(&format!("{} failed", operation), &err.to_string(), Some(metadata))
            {
                tracing::warn!("audit sink failed to record error for {}: {}", operation, e);
            }
        }
        result
    }
}

/// Make the default flags agree with the stored default pointer. A pointer to
/// a missing device, or no pointer over a non-empty map, falls back to the lowest id.
fn reconcile_default(
    devices: &mut BTreeMap<String, DeviceRecord>,
    stored: Option<String>,
) -> Option<String> {
    let default_device = match stored {
        Some(id) if devices.contains_key(&id) => Some(id),
        other => {
            let fallback = devices.keys().next().cloned();
            if fallback.is_some() {
                tracing::warn!(
                    "snapshot default {:?} is not a stored device, using {:?}",
                    other,
                    fallback
                );
            }
            fallback
        }
    };

    for (id, record) in devices.iter_mut() {
        record.is_default = default_device.as_deref() == Some(id.as_str());
    }

    default_device
}
