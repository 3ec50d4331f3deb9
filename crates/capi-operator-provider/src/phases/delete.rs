//! Deletion phase

use capi_operator_common::crd::{
    reasons, set_condition, Condition, ConditionSeverity, READY_CONDITION,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{PhaseError, PhaseResult, ProviderScope, WAIT_REQUEUE};
use crate::controller::Context;
use crate::installer::Installer;

/// Remove every installed object of the provider except CRDs and Namespaces.
///
/// Runs to completion even while the operator shuts down. Requeues until
/// the objects are actually gone.
pub(super) async fn delete(scope: &mut ProviderScope, ctx: &Context) -> Result<PhaseResult, PhaseError> {
    set_condition(
        &mut scope.provider.status.conditions,
        Condition::false_condition(
            READY_CONDITION,
            reasons::DELETING,
            ConditionSeverity::Info,
            "Provider is being deleted",
        ),
    );

    let detached = CancellationToken::new();
    let installer = Installer::new(ctx.ops.as_ref(), ctx.config.provider_ready_timeout, &detached);
    let removed = installer
        .uninstall(&scope.component_name())
        .await
        .map_err(|e| PhaseError::warning(READY_CONDITION, reasons::COMPONENTS_DELETION_ERROR, e))?;
    info!(provider = %scope.provider.key(), removed, "provider components removed");

    // objects with finalizers of their own linger after the delete call
    let remaining = installer
        .remaining(&scope.component_name())
        .await
        .map_err(|e| PhaseError::warning(READY_CONDITION, reasons::COMPONENTS_DELETION_ERROR, e))?;
    if !remaining.is_empty() {
        info!(
            provider = %scope.provider.key(),
            remaining = remaining.len(),
            "waiting for provider components to go away"
        );
        return Ok(PhaseResult::requeue_after(WAIT_REQUEUE));
    }
    Ok(PhaseResult::proceed())
}
