// ABOUTME: Health State for one device, the status/custom deltas that update it, and its validation rules.
// ABOUTME: Validation failures are one of the recovery triggers evaluated by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Open, protocol-specific fields reported alongside status.
pub type CustomState = serde_json::Map<String, Value>;

/// Where a device sits in the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthPhase {
    Healthy,
    Suspect,
    Recovering,
    Failed,
}

/// A command sent to a device, kept so recovery can replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl DeviceCommand {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Status object carried by a device report. `error` replaces the stored
/// error, so a report without one clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDelta {
    pub connected: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusDelta {
    pub fn connected() -> Self {
        Self {
            connected: true,
            error: None,
        }
    }

    pub fn disconnected(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateValidationError {
    #[error("status report has no status object")]
    MissingStatus,

    #[error("device reports connected but has never been seen")]
    ConnectedWithoutLastSeen,

    #[error("custom state field {0:?} is null")]
    NullCustomField(String),
}

/// Live connectivity and recovery bookkeeping for one registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub device_id: String,
    pub phase: HealthPhase,
    pub connected: bool,
    pub error: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_command: Option<DeviceCommand>,
    pub last_command_time: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    pub last_recovery_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub custom_state: CustomState,
}

impl HealthState {
    /// State for a freshly registered device: disconnected, never seen, no attempts.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            phase: HealthPhase::Suspect,
            connected: false,
            error: None,
            last_seen: None,
            last_command: None,
            last_command_time: None,
            recovery_attempts: 0,
            last_recovery_time: None,
            custom_state: CustomState::new(),
        }
    }

    /// Check the shape rules a trusted state must satisfy. Only top-level
    /// custom fields are inspected.
    ///
    /// The engine stamps `last_seen` on every report, so the connected rule
    /// only rejects states that were built by hand or deserialized.
    pub fn validate(&self) -> Result<(), StateValidationError> {
        if self.connected && self.last_seen.is_none() {
            return Err(StateValidationError::ConnectedWithoutLastSeen);
        }
        if let Some((name, _)) = self.custom_state.iter().find(|(_, v)| v.is_null()) {
            return Err(StateValidationError::NullCustomField(name.clone()));
        }
        Ok(())
    }

    /// Validate a status report merged into this state. A report without a
    /// status object is rejected before the state rules are checked.
    pub fn validate_report(&self, status: Option<&StatusDelta>) -> Result<(), StateValidationError> {
        if status.is_none() {
            return Err(StateValidationError::MissingStatus);
        }
        self.validate()
    }
}
