// ABOUTME: Collaborator traits the recovery engine drives: the command dispatcher and per-device handles.
// ABOUTME: Any error returned here aborts the current recovery attempt.

use async_trait::async_trait;
use thiserror::Error;

use crate::state::DeviceCommand;

/// Failure reported by a device handle or the command dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DeviceError(pub String);

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Routes commands to devices and owns their pending command queues.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Drop any commands still queued for `device_id`.
    async fn clear_queue(&self, device_id: &str) -> Result<(), DeviceError>;

    async fn send_command(&self, device_id: &str, command: &DeviceCommand)
    -> Result<(), DeviceError>;
}

/// Connection control for one physical device.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    async fn connect(&self) -> Result<(), DeviceError>;

    async fn disconnect(&self) -> Result<(), DeviceError>;
}
