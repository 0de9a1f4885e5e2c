//! Condition model
//!
//! Kubernetes-style conditions are the only readiness primitive Kiln has.
//! Each stage of a resource owns one condition type; overall readiness is the
//! logical AND over the kind's required types, with absent types counting as
//! false.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Container image is available (provided or built)
pub const CONDITION_CONTAINER_READY: &str = "ContainerReady";
/// Dataset artifact has been loaded and verified
pub const CONDITION_DATA_READY: &str = "DataReady";
/// Model artifact has been produced
pub const CONDITION_MODEL_READY: &str = "ModelReady";
/// Server Deployment has at least one ready replica
pub const CONDITION_SERVER_READY: &str = "ServerReady";
/// The resource hit an error that retrying cannot fix
pub const CONDITION_FAILED: &str = "Failed";

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., ContainerReady, DataReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition's status value changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True when the status is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Upsert a condition by type.
///
/// The transition time moves only when the status value changes; reason and
/// message are always refreshed. Returns true if the status value changed
/// (including when the condition was newly added).
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: impl Into<String>,
    message: impl Into<String>,
) -> bool {
    let status = ConditionStatus::from(status);
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            let changed = existing.status != status;
            if changed {
                existing.status = status;
                existing.last_transition_time = Utc::now();
            }
            existing.reason = reason.into();
            existing.message = message.into();
            changed
        }
        None => {
            conditions.push(Condition::new(type_, status, reason, message));
            true
        }
    }
}

/// Find a condition by type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True iff the condition is present and `True`
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(Condition::is_true)
}

/// True iff every required type is present and `True`.
///
/// Conditions outside `required` never influence the result.
pub fn all_ready(conditions: &[Condition], required: &[&str]) -> bool {
    required.iter().all(|t| is_true(conditions, t))
}
