//! Typed status conditions keyed by their `type`.
//!
//! A resource holds at most one condition per type: setting a condition
//! replaces the entry with the same type in place and leaves every other
//! entry where it was.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub const CERT_SECRET_RECONCILED: &str = "CertSecretReconciled";
pub const CONFIG_MAP_RECONCILED: &str = "ConfigMapReconciled";
pub const DEPLOYMENT_RECONCILED: &str = "DeploymentReconciled";
pub const SERVICE_RECONCILED: &str = "ServiceReconciled";
pub const POD_DISRUPTION_BUDGET_RECONCILED: &str = "PodDisruptionBudgetReconciled";
pub const CONFIGURATION_UP_TO_DATE: &str = "PolicyServerConfigurationUpToDate";
pub const POLICY_UNIQUELY_REACHABLE: &str = "PolicyUniquelyReachable";

pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    /// RFC3339 time of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            last_transition_time: None,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Upserts `condition` by type.
///
/// The transition time is only bumped when the status actually changes, so
/// re-asserting the same fact on every reconcile keeps the original time.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status != condition.status || existing.last_transition_time.is_none() {
            existing.last_transition_time = condition.last_transition_time.or_else(now);
        }
        existing.status = condition.status;
        existing.reason = condition.reason;
        existing.message = condition.message;
        return;
    }
    if condition.last_transition_time.is_none() {
        condition.last_transition_time = now();
    }
    conditions.push(condition);
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

pub fn set_true_condition(conditions: &mut Vec<Condition>, type_: &str) {
    set_condition(
        conditions,
        Condition::new(type_, ConditionStatus::True, RECONCILIATION_SUCCEEDED, ""),
    );
}

pub fn set_false_condition(conditions: &mut Vec<Condition>, type_: &str, message: impl Into<String>) {
    set_condition(
        conditions,
        Condition::new(type_, ConditionStatus::False, RECONCILIATION_FAILED, message),
    );
}

fn now() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_same_type_in_place() {
        let mut conditions = Vec::new();
        set_true_condition(&mut conditions, CONFIG_MAP_RECONCILED);
        set_true_condition(&mut conditions, DEPLOYMENT_RECONCILED);
        set_false_condition(&mut conditions, CONFIG_MAP_RECONCILED, "boom");

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, CONFIG_MAP_RECONCILED);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].reason, RECONCILIATION_FAILED);
        assert_eq!(conditions[0].message, "boom");
        assert_eq!(conditions[1].type_, DEPLOYMENT_RECONCILED);
    }

    #[test]
    fn transition_time_kept_while_status_is_stable() {
        let mut conditions = vec![Condition {
            last_transition_time: Some("2020-01-01T00:00:00Z".into()),
            ..Condition::new(SERVICE_RECONCILED, ConditionStatus::True, "", "")
        }];
        set_true_condition(&mut conditions, SERVICE_RECONCILED);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00Z")
        );

        set_false_condition(&mut conditions, SERVICE_RECONCILED, "gone");
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00Z")
        );
    }

    #[test]
    fn lookup_by_type() {
        let mut conditions = Vec::new();
        assert!(!is_condition_true(&conditions, CONFIGURATION_UP_TO_DATE));
        set_condition(
            &mut conditions,
            Condition::new(CONFIGURATION_UP_TO_DATE, true.into(), "ConfigurationVersionMatch", ""),
        );
        assert!(is_condition_true(&conditions, CONFIGURATION_UP_TO_DATE));
        assert!(find_condition(&conditions, POLICY_UNIQUELY_REACHABLE).is_none());
    }
}
