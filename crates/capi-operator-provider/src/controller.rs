//! Provider reconciler dispatcher
//!
//! One generic entry point serves all seven provider kinds. Each reconcile
//! converts the typed object into a kind-erased [`ProviderObject`], then:
//!
//! 1. adds the finalizer if missing and returns
//! 2. runs the delete phases when deletion was requested
//! 3. runs preflight, reporting failures on `PreflightCheck`
//! 4. runs the normal phases followed by the report phase
//!
//! Status is written once at the end with server-side apply.

use std::sync::Arc;
use std::time::Duration;

use capi_operator_common::crd::{
    reasons, set_condition, Condition, ConditionSeverity, GenericProvider, ProviderObject,
    PREFLIGHT_CHECK_CONDITION, PROVIDER_GROUP, PROVIDER_VERSION, READY_CONDITION,
};
use capi_operator_common::events::{actions, reasons as event_reasons, EventPublisher, KubeEventPublisher};
use capi_operator_common::retry::RetryConfig;
use capi_operator_common::{Error, PROVIDER_FINALIZER};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ClusterOps, KubeClusterOps};
use crate::config::OperatorConfig;
use crate::http::{HttpFetcher, ReqwestFetcher};
use crate::installer::readiness_poll;
use crate::phases::{
    run_phases, PhaseError, ProviderScope, DELETE_PHASES, NORMAL_PHASES, REPORT_PHASES,
    WAIT_REQUEUE,
};
use crate::preflight::preflight;

/// Controller name used for events
pub const CONTROLLER_NAME: &str = "capi-operator";

/// First retry delay after a failed reconcile
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Upper bound of the retry delay
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Shared state for all provider reconcilers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(Arc::new(config))
///     .cancel(shutdown.clone())
///     .build()?;
/// ```
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub ops: Arc<dyn ClusterOps>,
    /// HTTP client for artifact sources
    pub http: Arc<dyn HttpFetcher>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Catalog, image rules and timeouts, loaded once at startup
    pub config: Arc<OperatorConfig>,
    /// Retry policy for HTTP calls
    pub retry: RetryConfig,
    /// Backoff between deployment readiness checks
    pub readiness_poll: RetryConfig,
    /// Cancelled on shutdown
    pub cancel: CancellationToken,
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(ops: Arc<dyn ClusterOps>, http: Arc<dyn HttpFetcher>) -> Self {
        use capi_operator_common::events::NoopEventPublisher;

        Self {
            ops,
            http,
            events: Arc::new(NoopEventPublisher),
            config: Arc::new(OperatorConfig::default()),
            retry: RetryConfig {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                backoff_multiplier: 1.0,
            },
            readiness_poll: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 1.0,
            },
            cancel: CancellationToken::new(),
            failures: DashMap::new(),
        }
    }

    /// Consecutive failures recorded for an object
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).map(|count| *count).unwrap_or(0)
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    ops: Option<Arc<dyn ClusterOps>>,
    http: Option<Arc<dyn HttpFetcher>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: Option<Arc<OperatorConfig>>,
    retry: Option<RetryConfig>,
    cancel: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            ops: None,
            http: None,
            events: None,
            config: None,
            retry: None,
            cancel: None,
        }
    }

    /// Override the Kubernetes operations (primarily for testing)
    pub fn cluster_ops(mut self, ops: Arc<dyn ClusterOps>) -> Self {
        self.ops = Some(ops);
        self
    }

    /// Override the HTTP client
    pub fn http(mut self, http: Arc<dyn HttpFetcher>) -> Self {
        self.http = Some(http);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Operator configuration
    pub fn config(mut self, config: Arc<OperatorConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// HTTP retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Shutdown token
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let http: Arc<dyn HttpFetcher> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestFetcher::new()?),
        };
        Ok(Context {
            ops: self
                .ops
                .unwrap_or_else(|| Arc::new(KubeClusterOps::new(self.client.clone()))),
            http,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))),
            config: self.config.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            readiness_poll: readiness_poll(),
            cancel: self.cancel.unwrap_or_default(),
            failures: DashMap::new(),
        })
    }
}

/// Event target for a provider
pub fn object_reference(provider: &ProviderObject) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{}/{}", PROVIDER_GROUP, PROVIDER_VERSION)),
        kind: Some(provider.provider_type.kind().to_string()),
        name: provider.metadata.name.clone(),
        namespace: provider.metadata.namespace.clone(),
        uid: provider.metadata.uid.clone(),
        resource_version: provider.metadata.resource_version.clone(),
        ..Default::default()
    }
}

fn failure_key(provider: &ProviderObject) -> String {
    format!("{}/{}", provider.provider_type.kind(), provider.key())
}

/// Retry delay after `attempt` consecutive failures: 5s doubling, capped at 5 min
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX)
}

/// How a reconcile failed
enum Failure {
    /// Already recorded on the provider's conditions
    Reported(Error),
    /// Not projected onto a condition yet
    Untyped(Error),
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Failure::Untyped(error)
    }
}

/// Reconcile a provider of any kind
#[instrument(
    skip(provider, ctx),
    fields(
        kind = P::PROVIDER_TYPE.kind(),
        provider = %provider.name_any(),
        namespace = ?provider.namespace()
    )
)]
pub async fn reconcile<P: GenericProvider>(provider: Arc<P>, ctx: Arc<Context>) -> Result<Action, Error> {
    let object = provider.to_object();
    let key = failure_key(&object);
    debug!("reconciling provider");

    match dispatch(object.clone(), &ctx).await {
        Ok(action) => {
            ctx.failures.remove(&key);
            Ok(action)
        }
        Err(Failure::Reported(e)) => Err(e),
        Err(Failure::Untyped(e)) => {
            report_untyped(object, &e, &ctx).await;
            Err(e)
        }
    }
}

/// Requeue with per-object exponential backoff
pub fn error_policy<P: GenericProvider>(provider: Arc<P>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = failure_key(&provider.to_object());
    let attempts = {
        let mut count = ctx.failures.entry(key).or_insert(0);
        *count += 1;
        *count
    };
    let delay = backoff_delay(attempts);
    error!(
        ?error,
        kind = P::PROVIDER_TYPE.kind(),
        provider = %provider.name_any(),
        attempts,
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn dispatch(provider: ProviderObject, ctx: &Context) -> Result<Action, Failure> {
    if provider.is_deleting() {
        if !provider.has_finalizer(PROVIDER_FINALIZER) {
            return Ok(Action::await_change());
        }
        return delete(provider, ctx).await;
    }

    if !provider.has_finalizer(PROVIDER_FINALIZER) {
        info!(provider = %provider.key(), "adding finalizer");
        ctx.ops.add_finalizer(&provider, PROVIDER_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let mut scope = ProviderScope::new(provider);

    if let Err(failure) = preflight(&scope.provider, ctx).await {
        warn!(
            provider = %scope.provider.key(),
            reason = failure.reason,
            error = %failure.message(),
            "preflight failed"
        );
        failure.record(&mut scope.provider);
        write_status(&mut scope.provider, ctx).await?;
        if failure.severity == ConditionSeverity::Error {
            ctx.events
                .publish(
                    &object_reference(&scope.provider),
                    EventType::Warning,
                    event_reasons::PREFLIGHT_FAILED,
                    actions::RECONCILE,
                    Some(failure.message()),
                )
                .await;
        }
        return outcome(failure);
    }
    set_condition(
        &mut scope.provider.status.conditions,
        Condition::true_condition(PREFLIGHT_CHECK_CONDITION),
    );

    let result = match run_phases(NORMAL_PHASES, &mut scope, ctx).await {
        Ok(result) if result.requeue_after.is_none() => {
            run_phases(REPORT_PHASES, &mut scope, ctx).await.map(|_| result)
        }
        other => other,
    };

    match result {
        Ok(result) => {
            write_status(&mut scope.provider, ctx).await?;
            Ok(result
                .requeue_after
                .map(Action::requeue)
                .unwrap_or_else(Action::await_change))
        }
        Err(failure) => {
            warn!(
                provider = %scope.provider.key(),
                reason = failure.reason,
                condition = failure.condition_type,
                error = %failure.message(),
                "reconcile phase failed"
            );
            failure.record(&mut scope.provider);
            write_status(&mut scope.provider, ctx).await?;
            outcome(failure)
        }
    }
}

async fn delete(provider: ProviderObject, ctx: &Context) -> Result<Action, Failure> {
    info!(provider = %provider.key(), "deleting provider");
    let mut scope = ProviderScope::new(provider);

    match run_phases(DELETE_PHASES, &mut scope, ctx).await {
        Ok(result) => {
            if let Some(delay) = result.requeue_after {
                write_status(&mut scope.provider, ctx).await?;
                return Ok(Action::requeue(delay));
            }
        }
        Err(failure) => {
            failure.record(&mut scope.provider);
            write_status(&mut scope.provider, ctx).await?;
            return Err(Failure::Reported(failure.source));
        }
    }

    ctx.ops.remove_finalizer(&scope.provider, PROVIDER_FINALIZER).await?;
    ctx.events
        .publish(
            &object_reference(&scope.provider),
            EventType::Normal,
            event_reasons::PROVIDER_DELETED,
            actions::DELETE,
            Some(format!("{} removed", scope.component_name())),
        )
        .await;
    Ok(Action::await_change())
}

/// Error: wait for a spec change. Warning: back off. Info: fixed requeue.
fn outcome(failure: PhaseError) -> Result<Action, Failure> {
    match failure.severity {
        ConditionSeverity::Error => Ok(Action::await_change()),
        ConditionSeverity::Warning => Err(Failure::Reported(failure.source)),
        ConditionSeverity::Info => Ok(Action::requeue(WAIT_REQUEUE)),
    }
}

/// Patch status; a provider deleted meanwhile is not an error
async fn write_status(provider: &mut ProviderObject, ctx: &Context) -> Result<(), Error> {
    provider.status.observed_generation = provider.metadata.generation;
    match ctx.ops.patch_provider_status(provider).await {
        Err(e) if e.is_not_found() => {
            debug!(provider = %provider.key(), "provider gone before status update");
            Ok(())
        }
        other => other,
    }
}

async fn report_untyped(mut provider: ProviderObject, error: &Error, ctx: &Context) {
    set_condition(
        &mut provider.status.conditions,
        Condition::false_condition(
            READY_CONDITION,
            reasons::RECONCILE_ERROR,
            ConditionSeverity::Warning,
            error.message(),
        ),
    );
    if let Err(e) = write_status(&mut provider, ctx).await {
        debug!(provider = %provider.key(), error = %e, "could not report reconcile error");
    }
}
