// ABOUTME: Health tracking and recovery engine for fleetd devices.
// ABOUTME: Owns per-device Health State, staleness timers, and the bounded retry/backoff recovery loop.

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod event;
pub mod state;

pub use config::RecoveryConfig;
pub use device::{CommandDispatcher, DeviceError, DeviceHandle};
pub use engine::HealthEngine;
pub use error::RecoveryError;
pub use event::HealthEvent;
pub use state::{
    CustomState, DeviceCommand, HealthPhase, HealthState, StateValidationError, StatusDelta,
};
