// ABOUTME: Error types for the recovery engine.
// ABOUTME: Attempt failures are handled inside the engine; only lookup errors reach callers.

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceError;
use crate::state::StateValidationError;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("device not registered: {0}")]
    DeviceNotRegistered(String),

    #[error("command dispatcher failed: {0}")]
    Dispatcher(#[source] DeviceError),

    #[error("device handle failed: {0}")]
    Handle(#[source] DeviceError),

    #[error("state validation failed: {0}")]
    Validation(#[from] StateValidationError),

    #[error("recovery timed out after {0:?}")]
    TimedOut(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_step() {
        let err = RecoveryError::Handle(DeviceError::new("port busy"));
        assert_eq!(err.to_string(), "device handle failed: port busy");

        let err = RecoveryError::TimedOut(Duration::from_secs(10));
        assert_eq!(err.to_string(), "recovery timed out after 10s");

        let err: RecoveryError = StateValidationError::MissingStatus.into();
        assert!(matches!(err, RecoveryError::Validation(_)));
    }
}
