//! The `Available` and `Progressing` conditions written by every controller
use crate::{progress::ReconcileStatus, ConditionReason};
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether the OpenStack resource is usable
pub const AVAILABLE: &str = "Available";

/// Condition type reporting whether the controller is still working on the object
pub const PROGRESSING: &str = "Progressing";

/// Status of a condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single entry of `status.conditions`
///
/// Mirrors `metav1.Condition`; `lastTransitionTime` is kept as an RFC 3339 string so that a
/// condition read back from the API server compares equal to the one we wrote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, `Available` or `Progressing`
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    /// The object generation this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// When `status` last changed
    pub last_transition_time: String,
    /// A machine readable reason, one of [`ConditionReason`]
    pub reason: String,
    /// A human readable message
    pub message: String,
}

/// What the controller knows about the usability of the OpenStack resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    /// The resource was read and is usable
    Available,
    /// The resource was read, or could not be read, and is not usable
    NotAvailable,
    /// `status.id` is set but the resource has not been read in this pass
    Unknown,
}

/// Find a condition by type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type has status `True`
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

fn set(
    previous: &[Condition],
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: String,
    generation: Option<i64>,
    now: &str,
) -> Condition {
    let last_transition_time = match find(previous, type_) {
        Some(old) if old.status == status => old.last_transition_time.clone(),
        _ => now.to_string(),
    };
    Condition {
        type_: type_.to_string(),
        status,
        observed_generation: generation,
        last_transition_time,
        reason: reason.to_string(),
        message,
    }
}

/// Compute `Progressing` and `Available` from the outcome of a reconcile pass
///
/// `Progressing` is `False` only when the pass reported nothing, or when it failed terminally
/// (there is nothing more the controller can do without a spec change). `Available` copies the
/// reason and message of `Progressing` whenever the resource is not known to be usable.
pub fn common_conditions(
    previous: &[Condition],
    generation: Option<i64>,
    availability: Availability,
    status: &ReconcileStatus,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let now = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    let (progressing_status, reason, message) = if let Some((reason, message)) = status.terminal_error()
    {
        (ConditionStatus::False, reason, message)
    } else if let Some(message) = status.error_message() {
        (ConditionStatus::True, ConditionReason::TransientError, message)
    } else if status.needs_reschedule() {
        (
            ConditionStatus::True,
            ConditionReason::Progressing,
            status.messages().join("; "),
        )
    } else {
        (
            ConditionStatus::False,
            ConditionReason::Success,
            "OpenStack resource is up to date".to_string(),
        )
    };

    let progressing = set(
        previous,
        PROGRESSING,
        progressing_status,
        reason.as_str(),
        message.clone(),
        generation,
        &now,
    );

    let available = match availability {
        Availability::Available => set(
            previous,
            AVAILABLE,
            ConditionStatus::True,
            ConditionReason::Success.as_str(),
            "OpenStack resource is available".to_string(),
            generation,
            &now,
        ),
        Availability::NotAvailable => set(
            previous,
            AVAILABLE,
            ConditionStatus::False,
            reason.as_str(),
            message,
            generation,
            &now,
        ),
        Availability::Unknown => set(
            previous,
            AVAILABLE,
            ConditionStatus::Unknown,
            reason.as_str(),
            message,
            generation,
            &now,
        ),
    };

    vec![available, progressing]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{progress::Phase, CloudError};
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn up_to_date_resource_is_available_and_settled() {
        let conds = common_conditions(&[], Some(3), Availability::Available, &ReconcileStatus::ok(), at(0));
        let available = find(&conds, AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::True);
        assert_eq!(available.reason, "Success");
        assert_eq!(available.observed_generation, Some(3));
        let progressing = find(&conds, PROGRESSING).unwrap();
        assert_eq!(progressing.status, ConditionStatus::False);
        assert_eq!(progressing.message, "OpenStack resource is up to date");
    }

    #[test]
    fn waiting_is_reported_on_both_conditions() {
        let status = ReconcileStatus::waiting_on_object("Network", "N", Phase::Ready);
        let conds = common_conditions(&[], Some(1), Availability::NotAvailable, &status, at(0));
        let available = find(&conds, AVAILABLE).unwrap();
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.reason, "Progressing");
        assert_eq!(available.message, "Waiting for Network/N to be Ready");
        assert!(is_true(&conds, PROGRESSING));
    }

    #[test]
    fn terminal_errors_stop_progressing() {
        let status = ReconcileStatus::waiting_on_cloud(Phase::Ready, Duration::from_secs(15)).merge(
            ReconcileStatus::terminal(ConditionReason::DuplicateResource, "found 2 resources"),
        );
        let conds = common_conditions(&[], Some(1), Availability::NotAvailable, &status, at(0));
        let progressing = find(&conds, PROGRESSING).unwrap();
        assert_eq!(progressing.status, ConditionStatus::False);
        assert_eq!(progressing.reason, "DuplicateResource");
        let available = find(&conds, AVAILABLE).unwrap();
        assert_eq!(available.reason, "DuplicateResource");
        assert_eq!(available.message, "found 2 resources");
    }

    #[test]
    fn transient_errors_keep_progressing() {
        let status = ReconcileStatus::error(CloudError::Transport("connection reset".into()));
        let conds = common_conditions(&[], None, Availability::Unknown, &status, at(0));
        let progressing = find(&conds, PROGRESSING).unwrap();
        assert_eq!(progressing.status, ConditionStatus::True);
        assert_eq!(progressing.reason, "TransientError");
        assert_eq!(find(&conds, AVAILABLE).unwrap().status, ConditionStatus::Unknown);
    }

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let first = common_conditions(&[], Some(1), Availability::Available, &ReconcileStatus::ok(), at(10));
        let second = common_conditions(&first, Some(2), Availability::Available, &ReconcileStatus::ok(), at(20));
        assert_eq!(
            find(&second, AVAILABLE).unwrap().last_transition_time,
            "1970-01-01T00:00:10Z"
        );
        assert_eq!(find(&second, AVAILABLE).unwrap().observed_generation, Some(2));

        let third = common_conditions(
            &second,
            Some(2),
            Availability::NotAvailable,
            &ReconcileStatus::needs_refresh(),
            at(30),
        );
        assert_eq!(
            find(&third, AVAILABLE).unwrap().last_transition_time,
            "1970-01-01T00:00:30Z"
        );
    }

    #[test]
    fn serializes_like_metav1_condition() {
        let conds = common_conditions(&[], Some(1), Availability::Available, &ReconcileStatus::ok(), at(0));
        assert_json_diff::assert_json_eq!(
            serde_json::to_value(&conds[0]).unwrap(),
            serde_json::json!({
                "type": "Available",
                "status": "True",
                "observedGeneration": 1,
                "lastTransitionTime": "1970-01-01T00:00:00Z",
                "reason": "Success",
                "message": "OpenStack resource is available",
            })
        );
    }
}
