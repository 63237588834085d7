// ABOUTME: Core library for fleetd, containing device domain types, mode rules, and events.
// ABOUTME: This crate defines the shared data model used by the store, registry, and recovery crates.

pub mod audit;
pub mod device_type;
pub mod event;
pub mod model;
pub mod resolve;

pub use audit::{AuditEntry, AuditError, AuditKind, AuditSink, MemoryAuditSink, NoopAuditSink};
pub use device_type::{ConfigLookupError, DeviceConfigProvider, DeviceTypeCatalog, DeviceTypeConfig};
pub use event::RegistryEvent;
pub use model::{
    DeviceFilter, DeviceRecord, DeviceState, FeatureDescriptor, Mode, ParseModeError,
    PricingProfile,
};
pub use resolve::{resolve_features, resolve_pricing};
