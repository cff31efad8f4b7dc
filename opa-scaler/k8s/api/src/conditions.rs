//! Status condition vocabulary shared by the opa-scaler resources.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const AVAILABLE: &str = "Available";
pub const PROGRESSING: &str = "Progressing";
pub const DEGRADED: &str = "Degraded";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

// OpaEngine reasons.
pub const REASON_RECONCILING: &str = "Reconciling";
pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_UNAVAILABLE: &str = "Unavailable";
pub const REASON_SERVICE_ERROR: &str = "ServiceError";
pub const REASON_DEPLOYMENT_ERROR: &str = "DeploymentError";

// Dependency reasons.
pub const REASON_DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
pub const REASON_POLICY_NOT_FOUND: &str = "PolicyNotFound";
pub const REASON_SCHEDULED: &str = "Scheduled";
pub const REASON_POLICY_SCHEDULED: &str = "PolicyScheduled";
pub const REASON_POLICY_DEPLOYED: &str = "PolicyDeployed";

/// Builds a condition stamped with the current time.
pub fn condition(type_: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        last_transition_time: Time(Utc::now()),
        message: message.to_string(),
        observed_generation: None,
        reason: reason.to_string(),
        status: status.to_string(),
        type_: type_.to_string(),
    }
}

/// Append-or-update merge, deduplicated by `type`.
///
/// Re-setting an existing (type, status, reason) is a no-op; any other
/// change replaces the entry, refreshing its transition time. Returns true
/// when the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status && existing.reason == new.reason {
                return false;
            }
            *existing = new;
            true
        }
        None => {
            conditions.push(new);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_new_condition_types() {
        let mut conditions = Vec::new();
        assert!(set_condition(
            &mut conditions,
            condition(AVAILABLE, STATUS_UNKNOWN, REASON_RECONCILING, "starting"),
        ));
        assert!(set_condition(
            &mut conditions,
            condition(DEGRADED, STATUS_TRUE, REASON_SERVICE_ERROR, ""),
        ));
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, AVAILABLE);
        assert_eq!(conditions[1].type_, DEGRADED);
    }

    #[test]
    fn resetting_same_status_and_reason_is_a_noop() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            condition(AVAILABLE, STATUS_TRUE, REASON_AVAILABLE, "engine is available"),
        );
        let before = conditions[0].last_transition_time.clone();

        assert!(!set_condition(
            &mut conditions,
            condition(AVAILABLE, STATUS_TRUE, REASON_AVAILABLE, "engine is available"),
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, before);
    }

    #[test]
    fn status_transition_replaces_the_entry() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            condition(AVAILABLE, STATUS_FALSE, REASON_UNAVAILABLE, ""),
        );
        assert!(set_condition(
            &mut conditions,
            condition(AVAILABLE, STATUS_TRUE, REASON_AVAILABLE, ""),
        ));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, STATUS_TRUE);
        assert_eq!(conditions[0].reason, REASON_AVAILABLE);
    }
}
