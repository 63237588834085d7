// ABOUTME: Device registry for fleetd, the authoritative map of device records and the default pointer.
// ABOUTME: Every mutation runs inside a persistence transaction and emits a registry event after commit.

pub mod error;
pub mod operation;
pub mod registry;

pub use error::RegistryError;
pub use operation::{AllowAll, OperationPolicy};
pub use registry::{DeviceRegistry, NewDevice};
