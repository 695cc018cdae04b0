//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for managing StackSet status
//! conditions following the Kubernetes API conventions.

use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// StackSet condition types
pub const STACKSET_CONDITION_READY: &str = "Ready";
pub const STACKSET_CONDITION_STACKS_SYNCED: &str = "StacksSynced";
pub const STACKSET_CONDITION_INVALID: &str = "InvalidStackSet";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ConditionFields {
    ConditionFields {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Generic condition fields convertible into the CRD condition type.
#[derive(Debug, Clone)]
pub struct ConditionFields {
    pub condition_type: String,
    pub status: String,
    pub last_transition_time: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ConditionFields {
    pub fn into_stackset_condition(self) -> crate::crd::StackSetCondition {
        crate::crd::StackSetCondition {
            r#type: self.condition_type,
            status: self.status,
            last_transition_time: self.last_transition_time,
            reason: self.reason,
            message: self.message,
        }
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ConditionFields>, new: ConditionFields) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_condition() {
        let cond = build_condition(
            STACKSET_CONDITION_READY,
            CONDITION_TRUE,
            "AllStacksReady",
            "All stacks ready",
        );
        assert_eq!(cond.condition_type, "Ready");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("AllStacksReady"));
        assert_eq!(cond.message.as_deref(), Some("All stacks ready"));
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        let cond = build_condition("Ready", CONDITION_TRUE, "OK", "ok");
        set_condition(&mut conditions, cond);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        let cond1 = ConditionFields {
            condition_type: "Ready".to_string(),
            status: CONDITION_TRUE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("First".to_string()),
            message: Some("first".to_string()),
        };
        conditions.push(cond1);

        let cond2 = build_condition("Ready", CONDITION_TRUE, "Second", "second");
        set_condition(&mut conditions, cond2);

        assert_eq!(conditions.len(), 1);
        // Transition time preserved because status didn't change
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].reason.as_deref(), Some("Second"));
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_status_change() {
        let mut conditions = Vec::new();
        let cond1 = ConditionFields {
            condition_type: "InvalidStackSet".to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("Valid".to_string()),
            message: Some("valid".to_string()),
        };
        conditions.push(cond1);

        let cond2 = build_condition(
            "InvalidStackSet",
            CONDITION_TRUE,
            "EmptyTemplate",
            "stack template has no containers",
        );
        set_condition(&mut conditions, cond2);

        assert_eq!(conditions.len(), 1);
        // Transition time updated because status changed
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_into_stackset_condition() {
        let cond = build_condition("Ready", CONDITION_TRUE, "OK", "ok");
        let sc = cond.into_stackset_condition();
        assert_eq!(sc.r#type, "Ready");
        assert_eq!(sc.status, "True");
    }
}
