//! Phase engine for provider reconciliation.
//!
//! A reconcile runs an ordered list of phases over a [`ProviderScope`]. A
//! phase either lets the list continue, completes it early, asks for a
//! requeue, or fails with a [`PhaseError`] that names the condition, reason
//! and severity to record on the provider.

mod delete;
mod normal;

use std::collections::BTreeMap;
use std::time::Duration;

use capi_operator_common::crd::{
    set_condition, Condition, ConditionSeverity, ProviderObject, READY_CONDITION,
};
use capi_operator_common::Error;
use thiserror::Error;
use tracing::debug;

use crate::components::ManifestObject;
use crate::controller::Context;
use crate::repository::ManifestRepository;
use crate::sources::SourceCredentials;

#[cfg(test)]
pub(crate) use normal::spec_hash;

/// Fixed delay while waiting on something outside this provider
pub const WAIT_REQUEUE: Duration = Duration::from_secs(30);

/// Outcome of a successful phase
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhaseResult {
    /// Stop the list and come back after this delay
    pub requeue_after: Option<Duration>,
    /// Stop the list, nothing left to do
    pub completed: bool,
}

impl PhaseResult {
    /// Continue with the next phase
    pub fn proceed() -> Self {
        Self::default()
    }

    /// End the list successfully
    pub fn completed() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }

    /// End the list and requeue later
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            ..Self::default()
        }
    }

    fn stops(&self) -> bool {
        self.completed || self.requeue_after.is_some()
    }
}

/// A phase failure projected onto a provider condition
#[derive(Debug, Error)]
#[error("{reason}: {source}")]
pub struct PhaseError {
    /// Condition reason
    pub reason: &'static str,
    /// Condition type to set False
    pub condition_type: &'static str,
    /// Error: wait for a spec change. Warning: retry with backoff. Info: requeue after a fixed delay.
    pub severity: ConditionSeverity,
    /// Underlying error
    pub source: Error,
}

impl PhaseError {
    /// A failure with explicit severity
    pub fn new(
        condition_type: &'static str,
        reason: &'static str,
        severity: ConditionSeverity,
        source: Error,
    ) -> Self {
        Self {
            reason,
            condition_type,
            severity,
            source,
        }
    }

    /// Terminal until the spec changes
    pub fn error(condition_type: &'static str, reason: &'static str, source: Error) -> Self {
        Self::new(condition_type, reason, ConditionSeverity::Error, source)
    }

    /// Transient, retried with backoff
    pub fn warning(condition_type: &'static str, reason: &'static str, source: Error) -> Self {
        Self::new(condition_type, reason, ConditionSeverity::Warning, source)
    }

    /// Waiting on external state
    pub fn info(condition_type: &'static str, reason: &'static str, source: Error) -> Self {
        Self::new(condition_type, reason, ConditionSeverity::Info, source)
    }

    /// Condition message
    pub fn message(&self) -> String {
        self.source.message()
    }

    /// The False condition this failure records
    pub fn condition(&self) -> Condition {
        Condition::false_condition(self.condition_type, self.reason, self.severity, self.message())
    }

    /// Record on the provider: the failing condition, mirrored onto Ready
    pub fn record(&self, provider: &mut ProviderObject) {
        set_condition(&mut provider.status.conditions, self.condition());
        set_condition(
            &mut provider.status.conditions,
            Condition::false_condition(READY_CONDITION, self.reason, self.severity, self.message()),
        );
    }
}

/// Everything a reconcile accumulates while its phases run
#[derive(Debug)]
pub struct ProviderScope {
    /// Provider being reconciled; its status is rewritten in place
    pub provider: ProviderObject,
    /// Template variables from the config secret
    pub variables: BTreeMap<String, String>,
    /// Source credentials from the config secret
    pub credentials: SourceCredentials,
    /// Hash of spec and secret content for the applied-spec annotation
    pub spec_hash: String,
    /// Repository loaded for the target version
    pub repository: Option<ManifestRepository>,
    /// Version being installed
    pub target_version: Option<String>,
    /// Contract of the target version
    pub contract: Option<String>,
    /// Rendered, transformed components
    pub components: Vec<ManifestObject>,
    /// Whether an installed version is being replaced
    pub upgrading: bool,
}

impl ProviderScope {
    /// Fresh scope for a provider
    pub fn new(provider: ProviderObject) -> Self {
        Self {
            provider,
            variables: BTreeMap::new(),
            credentials: SourceCredentials::default(),
            spec_hash: String::new(),
            repository: None,
            target_version: None,
            contract: None,
            components: Vec::new(),
            upgrading: false,
        }
    }

    /// clusterctl component name of the provider
    pub fn component_name(&self) -> String {
        self.provider.component_name()
    }
}

/// One step of a phase list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Read the config secret, short-circuit when nothing changed
    Init,
    /// Resolve the source and fetch the target version
    DownloadManifests,
    /// Check the contract of the target version
    Load,
    /// Render and transform the components
    Fetch,
    /// Remove objects dropped by a new version
    Upgrade,
    /// Apply components and wait for readiness
    Install,
    /// Summarize into the Ready condition
    ReportStatus,
    /// Remove installed components
    Delete,
}

/// Phases of a create or update
pub const NORMAL_PHASES: &[Phase] = &[
    Phase::Init,
    Phase::DownloadManifests,
    Phase::Load,
    Phase::Fetch,
    Phase::Upgrade,
    Phase::Install,
];

/// Phases run after a successful normal list
pub const REPORT_PHASES: &[Phase] = &[Phase::ReportStatus];

/// Phases of a deletion
pub const DELETE_PHASES: &[Phase] = &[Phase::Delete];

impl Phase {
    /// Name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::DownloadManifests => "downloadManifests",
            Self::Load => "load",
            Self::Fetch => "fetch",
            Self::Upgrade => "upgrade",
            Self::Install => "install",
            Self::ReportStatus => "reportStatus",
            Self::Delete => "delete",
        }
    }

    async fn run(self, scope: &mut ProviderScope, ctx: &Context) -> Result<PhaseResult, PhaseError> {
        match self {
            Self::Init => normal::init(scope, ctx).await,
            Self::DownloadManifests => normal::download_manifests(scope, ctx).await,
            Self::Load => normal::load(scope, ctx).await,
            Self::Fetch => normal::fetch(scope, ctx).await,
            Self::Upgrade => normal::upgrade(scope, ctx).await,
            Self::Install => normal::install(scope, ctx).await,
            Self::ReportStatus => normal::report_status(scope),
            Self::Delete => delete::delete(scope, ctx).await,
        }
    }
}

/// Run phases in order.
///
/// An error ends the list; so does a completed or requeueing result, which
/// is returned as is.
pub async fn run_phases(
    phases: &[Phase],
    scope: &mut ProviderScope,
    ctx: &Context,
) -> Result<PhaseResult, PhaseError> {
    for phase in phases {
        debug!(phase = phase.name(), provider = %scope.provider.key(), "running phase");
        let result = phase.run(scope, ctx).await?;
        if result.stops() {
            debug!(phase = phase.name(), ?result, "phase list stopped early");
            return Ok(result);
        }
    }
    Ok(PhaseResult::proceed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capi_operator_common::crd::{
        get_condition, reasons, ConditionStatus, ProviderSpec, ProviderType,
        PROVIDER_INSTALLED_CONDITION,
    };

    #[test]
    fn phase_errors_mirror_onto_ready() {
        let mut provider =
            ProviderObject::new(ProviderType::Core, "cluster-api", "capi-system", ProviderSpec::default());
        let err = PhaseError::warning(
            PROVIDER_INSTALLED_CONDITION,
            reasons::COMPONENTS_FETCH_ERROR,
            Error::fetch("github", "connection reset"),
        );
        err.record(&mut provider);

        let installed = get_condition(&provider.status.conditions, PROVIDER_INSTALLED_CONDITION).unwrap();
        assert_eq!(installed.status, ConditionStatus::False);
        assert_eq!(installed.severity, Some(ConditionSeverity::Warning));
        assert_eq!(installed.message, "connection reset");
        let ready = get_condition(&provider.status.conditions, READY_CONDITION).unwrap();
        assert_eq!(ready.reason, reasons::COMPONENTS_FETCH_ERROR);
        assert!(err.to_string().starts_with("ComponentsFetchError"));
    }

    #[test]
    fn phase_lists_are_ordered() {
        let names: Vec<_> = NORMAL_PHASES.iter().map(Phase::name).collect();
        assert_eq!(
            names,
            vec!["init", "downloadManifests", "load", "fetch", "upgrade", "install"]
        );
        assert_eq!(REPORT_PHASES, &[Phase::ReportStatus]);
        assert_eq!(DELETE_PHASES, &[Phase::Delete]);
    }

    #[test]
    fn completed_and_requeue_results_stop_the_list() {
        assert!(!PhaseResult::proceed().stops());
        assert!(PhaseResult::completed().stops());
        assert!(PhaseResult::requeue_after(WAIT_REQUEUE).stops());
    }
}
