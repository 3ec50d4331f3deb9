//! Kubernetes Event recording for provider reconcilers.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons shown under REASON in `kubectl get events`.
pub mod reasons {
    /// Preflight rejected the provider
    pub const PREFLIGHT_FAILED: &str = "PreflightFailed";
    /// Components applied and ready
    pub const PROVIDER_INSTALLED: &str = "ProviderInstalled";
    /// Components moved to a new version
    pub const PROVIDER_UPGRADED: &str = "ProviderUpgraded";
    /// Components removed
    pub const PROVIDER_DELETED: &str = "ProviderDeleted";
    /// A phase failed
    pub const INSTALL_FAILED: &str = "InstallFailed";
}

/// Event actions shown under ACTION.
pub mod actions {
    /// Regular reconcile
    pub const RECONCILE: &str = "Reconcile";
    /// Upgrade of installed components
    pub const UPGRADE: &str = "Upgrade";
    /// Deletion of installed components
    pub const DELETE: &str = "Delete";
}
