//! Status condition types shared by all provider kinds

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Preflight validation outcome
pub const PREFLIGHT_CHECK_CONDITION: &str = "PreflightCheck";
/// Components applied to the cluster
pub const PROVIDER_INSTALLED_CONDITION: &str = "ProviderInstalled";
/// Components moved to a new version
pub const PROVIDER_UPGRADED_CONDITION: &str = "ProviderUpgraded";
/// Summary condition
pub const READY_CONDITION: &str = "Ready";

/// Well-known condition reasons.
pub mod reasons {
    /// `spec.version` is not semver
    pub const INCORRECT_VERSION_FORMAT: &str = "IncorrectVersionFormat";
    /// Target minor/major is lower than the installed one
    pub const UNSUPPORTED_PROVIDER_DOWNGRADE: &str = "UnsupportedProviderDowngrade";
    /// Core provider not named `cluster-api`
    pub const INCORRECT_CORE_PROVIDER_NAME: &str = "IncorrectCoreProviderName";
    /// Singleton or name uniqueness violated
    pub const MORE_THAN_ONE_PROVIDER_INSTANCE_EXISTS: &str = "MoreThanOneProviderInstanceExists";
    /// fetchConfig missing or ambiguous
    pub const FETCH_CONFIG_VALIDATION_ERROR: &str = "FetchConfigValidationError";
    /// github-token rejected by GitHub
    pub const INVALID_GITHUB_TOKEN: &str = "InvalidGithubToken";
    /// Core provider missing or not Ready
    pub const WAITING_FOR_CORE_PROVIDER_READY: &str = "WaitingForCoreProviderReady";
    /// Provider or version cannot be resolved
    pub const UNKNOWN_PROVIDER: &str = "UnknownProvider";
    /// Contract does not match the core provider or the operator
    pub const CAPI_VERSION_INCOMPATIBILITY: &str = "CAPIVersionIncompatibility";
    /// Artifacts could not be fetched or read
    pub const COMPONENTS_FETCH_ERROR: &str = "ComponentsFetchError";
    /// Namespace pinning or deployment customization failed
    pub const COMPONENTS_CUSTOMIZATION_ERROR: &str = "ComponentsCustomizationError";
    /// A manifest patch failed to parse or apply
    pub const COMPONENTS_PATCH_ERROR: &str = "ComponentsPatchError";
    /// Image override rules could not be applied
    pub const COMPONENTS_IMAGE_OVERRIDE_ERROR: &str = "ComponentsImageOverrideError";
    /// Applying a new version failed
    pub const COMPONENTS_UPGRADE_ERROR: &str = "ComponentsUpgradeError";
    /// Removing objects dropped by a new version failed
    pub const OLD_COMPONENTS_DELETION_ERROR: &str = "OldComponentsDeletionError";
    /// Applying components failed
    pub const COMPONENTS_INSTALL_ERROR: &str = "ComponentsInstallError";
    /// Deleting components failed
    pub const COMPONENTS_DELETION_ERROR: &str = "ComponentsDeletionError";
    /// Generic failure outside the typed phase errors
    pub const RECONCILE_ERROR: &str = "ReconcileError";
    /// Deletion in progress
    pub const DELETING: &str = "Deleting";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
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

/// How bad a False condition is.
///
/// Only meaningful when status is False.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// Needs user action
    Error,
    /// Transient, retried with backoff
    Warning,
    /// Waiting on something outside this provider
    Info,
}

impl std::fmt::Display for ConditionSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "Error"),
            Self::Warning => write!(f, "Warning"),
            Self::Info => write!(f, "Info"),
        }
    }
}

/// Cluster API style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, PreflightCheck)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Severity, set only when status is False
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// A True condition with no reason
    pub fn true_condition(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::True,
            severity: None,
            reason: String::new(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    /// A False condition with reason, severity and message
    pub fn false_condition(
        type_: impl Into<String>,
        reason: impl Into<String>,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// An Unknown condition
    pub fn unknown_condition(
        type_: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::Unknown,
            severity: None,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same content ignoring the transition timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Insert or replace a condition by type.
///
/// The transition time is kept when the status did not change, so repeated
/// reconciles with the same outcome produce identical status documents.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
    sort_conditions(conditions);
}

/// Find a condition by type
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

// Ready first, the rest alphabetical.
fn sort_conditions(conditions: &mut [Condition]) {
    conditions.sort_by(|a, b| {
        let a_ready = a.type_ == READY_CONDITION;
        let b_ready = b.type_ == READY_CONDITION;
        b_ready.cmp(&a_ready).then_with(|| a.type_.cmp(&b.type_))
    });
}
