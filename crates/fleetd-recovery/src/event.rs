// ABOUTME: Events emitted by the recovery engine on its broadcast channel.

use serde::{Deserialize, Serialize};

use crate::state::HealthState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HealthEvent {
    StateChanged { device_id: String, state: HealthState },
    RecoveryStarted { device_id: String, attempt: u32 },
    RecoveryCompleted { device_id: String },
    RecoveryFailed { device_id: String, attempts: u32 },
}

impl HealthEvent {
    pub fn device_id(&self) -> &str {
        match self {
            HealthEvent::StateChanged { device_id, .. }
            | HealthEvent::RecoveryStarted { device_id, .. }
            | HealthEvent::RecoveryCompleted { device_id }
            | HealthEvent::RecoveryFailed { device_id, .. } => device_id,
        }
    }
}
