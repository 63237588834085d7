// ABOUTME: Names of the mutating registry operations and the production authorization hook.
// ABOUTME: validate_operation rejects unknown names and consults an OperationPolicy in production mode.

use fleetd_core::Mode;

pub const ADD_DEVICE: &str = "add_device";
pub const DELETE_DEVICE: &str = "delete_device";
pub const PROMOTE_DEVICE: &str = "promote_device";
pub const SET_MODE: &str = "set_mode";

/// Every operation name the registry accepts.
pub const OPERATIONS: [&str; 4] = [ADD_DEVICE, DELETE_DEVICE, PROMOTE_DEVICE, SET_MODE];

pub fn is_known(operation: &str) -> bool {
    OPERATIONS.contains(&operation)
}

/// Extra authorization applied to mutating operations while the registry is
/// in production mode. Development mode never consults the policy.
pub trait OperationPolicy: Send + Sync {
    fn authorize(&self, operation: &str, mode: Mode) -> bool;
}

/// Policy that authorizes everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl OperationPolicy for AllowAll {
    fn authorize(&self, _operation: &str, _mode: Mode) -> bool {
        true
    }
}

impl<F> OperationPolicy for F
where
    F: Fn(&str, Mode) -> bool + Send + Sync,
{
    fn authorize(&self, operation: &str, mode: Mode) -> bool {
        self(operation, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_operations() {
        for op in OPERATIONS {
            assert!(is_known(op));
        }
        assert!(!is_known("format_disk"));
        assert!(!is_known(""));
    }

    #[test]
    fn closures_act_as_policies() {
        let policy = |op: &str, _mode: Mode| op != SET_MODE;
        assert!(policy.authorize(ADD_DEVICE, Mode::Production));
        assert!(!policy.authorize(SET_MODE, Mode::Production));
    }
}
