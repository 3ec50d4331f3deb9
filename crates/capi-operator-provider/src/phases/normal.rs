//! Create and update phases

use std::collections::BTreeMap;

use capi_operator_common::crd::{
    reasons, set_condition, Condition, ProviderObject, ProviderType,
    PROVIDER_INSTALLED_CONDITION, PROVIDER_UPGRADED_CONDITION, READY_CONDITION,
};
use capi_operator_common::events::{actions, reasons as event_reasons};
use capi_operator_common::kube_utils::sha256_hex;
use capi_operator_common::{Error, APPLIED_SPEC_HASH_ANNOTATION};
use kube::runtime::events::EventType;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{PhaseError, PhaseResult, ProviderScope};
use crate::components::{add_managed_labels, parse_components, template_variables, ManifestObject};
use crate::controller::{object_reference, Context};
use crate::installer::Installer;
use crate::repository::{ManifestRepository, RepositoryLoader};
use crate::sources::configmap::MANIFESTS_KEY;
use crate::sources::{secret_data_hash, secret_string_data, SourceCredentials};
use crate::transform::{transform_components, Stage};
use crate::version::{parse_version, same_version};

fn fetch_failure(error: Error) -> PhaseError {
    if error.is_retryable() {
        PhaseError::warning(PROVIDER_INSTALLED_CONDITION, reasons::COMPONENTS_FETCH_ERROR, error)
    } else {
        PhaseError::error(PROVIDER_INSTALLED_CONDITION, reasons::COMPONENTS_FETCH_ERROR, error)
    }
}

fn incompatible(message: String) -> PhaseError {
    PhaseError::error(
        PROVIDER_INSTALLED_CONDITION,
        reasons::CAPI_VERSION_INCOMPATIBILITY,
        Error::validation(message),
    )
}

/// Variables and credentials from a provider's config secret.
///
/// Returns the secret content hash alongside; empty without a secret.
async fn read_config_secret(
    provider: &ProviderObject,
    ctx: &Context,
) -> Result<(SourceCredentials, BTreeMap<String, String>, String), PhaseError> {
    let Some(reference) = &provider.spec.config_secret else {
        return Ok(Default::default());
    };
    let namespace = reference.namespace.as_deref().unwrap_or(provider.namespace());
    let secret = ctx
        .ops
        .get_secret(&reference.name, namespace)
        .await
        .map_err(fetch_failure)?
        .ok_or_else(|| {
            PhaseError::warning(
                PROVIDER_INSTALLED_CONDITION,
                reasons::COMPONENTS_FETCH_ERROR,
                Error::not_found(format!(
                    "config secret {}/{} not found",
                    namespace, reference.name
                )),
            )
        })?;
    let data = secret_string_data(&secret);
    Ok((
        SourceCredentials::from_data(&data),
        template_variables(&data),
        secret_data_hash(Some(&secret)),
    ))
}

/// Hash of everything an install depends on besides the upstream release
pub(crate) fn spec_hash(provider: &ProviderObject, secret_hash: &str) -> String {
    let input = json!({
        "spec": provider.spec,
        "secret": secret_hash,
        "version": provider.spec.desired_version(),
    });
    sha256_hex(input.to_string().as_bytes())
}

/// Read the config secret and skip the pipeline when nothing changed since
/// the last successful install.
pub(super) async fn init(scope: &mut ProviderScope, ctx: &Context) -> Result<PhaseResult, PhaseError> {
    let (credentials, variables, secret_hash) = read_config_secret(&scope.provider, ctx).await?;
    scope.credentials = credentials;
    scope.variables = variables;
    scope.spec_hash = spec_hash(&scope.provider, &secret_hash);

    let provider = &scope.provider;
    let unchanged = provider.annotation(APPLIED_SPEC_HASH_ANNOTATION) == Some(scope.spec_hash.as_str());
    let at_desired_version = match (provider.spec.desired_version(), provider.installed_version()) {
        (None, Some(_)) => true,
        (Some(desired), Some(installed)) => same_version(desired, installed),
        (_, None) => false,
    };
    if unchanged && provider.is_ready() && at_desired_version {
        debug!(provider = %provider.key(), "spec and secret unchanged since last install");
        return Ok(PhaseResult::completed());
    }
    Ok(PhaseResult::proceed())
}

/// Resolve the artifact source and fetch the target version
pub(super) async fn download_manifests(
    scope: &mut ProviderScope,
    ctx: &Context,
) -> Result<PhaseResult, PhaseError> {
    let loader = RepositoryLoader::new(
        ctx.ops.clone(),
        ctx.http.clone(),
        &ctx.config.catalog,
        ctx.retry.clone(),
    );
    let desired = scope.provider.spec.desired_version();
    let (repository, version) = loader
        .load(&scope.provider, &scope.credentials, desired, false)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                PhaseError::error(PROVIDER_INSTALLED_CONDITION, reasons::UNKNOWN_PROVIDER, e)
            } else {
                fetch_failure(e)
            }
        })?;
    info!(
        provider = %scope.provider.key(),
        version = %version,
        source = %repository.source(),
        "provider release downloaded"
    );
    scope.repository = Some(repository);
    scope.target_version = Some(version);
    Ok(PhaseResult::proceed())
}

fn loaded(scope: &ProviderScope) -> Result<(&ManifestRepository, &str), PhaseError> {
    match (&scope.repository, &scope.target_version) {
        (Some(repository), Some(version)) => Ok((repository, version.as_str())),
        _ => Err(PhaseError::warning(
            PROVIDER_INSTALLED_CONDITION,
            reasons::COMPONENTS_FETCH_ERROR,
            Error::internal("provider release was not downloaded"),
        )),
    }
}

fn contract_of(repository: &ManifestRepository, provider: &ProviderObject, version: &str) -> Result<String, PhaseError> {
    let metadata = repository.metadata(version).map_err(fetch_failure)?;
    let unknown = |message: String| {
        PhaseError::error(
            PROVIDER_INSTALLED_CONDITION,
            reasons::UNKNOWN_PROVIDER,
            Error::validation(message),
        )
    };
    let parsed = parse_version(version).map_err(|e| unknown(e.message()))?;
    metadata
        .contract_for(&parsed)
        .map(str::to_string)
        .ok_or_else(|| {
            unknown(format!(
                "invalid provider metadata: version {} for the provider {} does not match any release series",
                version,
                provider.key()
            ))
        })
}

/// Contract of the installed core provider, if one is installed
async fn core_contract(ctx: &Context) -> Result<Option<String>, PhaseError> {
    let cores = ctx
        .ops
        .list_providers(ProviderType::Core)
        .await
        .map_err(fetch_failure)?;
    let Some(core) = cores.into_iter().find(|c| c.installed_version().is_some()) else {
        return Ok(None);
    };
    if let Some(contract) = core.status.contract.as_deref().filter(|c| !c.is_empty()) {
        return Ok(Some(contract.to_string()));
    }

    // older status without a contract: read it from the core's release metadata
    let (credentials, _, _) = read_config_secret(&core, ctx).await?;
    let loader = RepositoryLoader::new(
        ctx.ops.clone(),
        ctx.http.clone(),
        &ctx.config.catalog,
        ctx.retry.clone(),
    );
    let installed = core.installed_version().map(str::to_string);
    let (repository, version) = loader
        .load(&core, &credentials, installed.as_deref(), true)
        .await
        .map_err(fetch_failure)?;
    contract_of(&repository, &core, &version).map(Some)
}

/// Check the contract of the target version against the operator and the core provider
pub(super) async fn load(scope: &mut ProviderScope, ctx: &Context) -> Result<PhaseResult, PhaseError> {
    let (repository, version) = loaded(scope)?;
    let contract = contract_of(repository, &scope.provider, version)?;

    if !ctx.config.supports_contract(&contract) {
        return Err(incompatible(format!(
            "current version of the operator supports contracts [{}]; {} {} implements {}",
            ctx.config.supported_contracts.join(", "),
            scope.provider.key(),
            version,
            contract
        )));
    }

    if scope.provider.provider_type != ProviderType::Core {
        if let Some(core) = core_contract(ctx).await? {
            if core != contract {
                return Err(incompatible(format!(
                    "core provider contract {} does not match contract {} of {} {}",
                    core,
                    contract,
                    scope.provider.key(),
                    version
                )));
            }
        }
    }

    scope.contract = Some(contract);
    Ok(PhaseResult::proceed())
}

async fn additional_manifests(
    scope: &ProviderScope,
    ctx: &Context,
) -> Result<Vec<ManifestObject>, PhaseError> {
    let Some(reference) = &scope.provider.spec.additional_manifests else {
        return Ok(Vec::new());
    };
    let namespace = reference.namespace.as_deref().unwrap_or(scope.provider.namespace());
    let configmap = ctx
        .ops
        .get_configmap(&reference.name, namespace)
        .await
        .map_err(fetch_failure)?
        .ok_or_else(|| {
            PhaseError::warning(
                PROVIDER_INSTALLED_CONDITION,
                reasons::COMPONENTS_FETCH_ERROR,
                Error::not_found(format!(
                    "additional manifests configmap {}/{} not found",
                    namespace, reference.name
                )),
            )
        })?;
    let text = configmap
        .data
        .as_ref()
        .and_then(|d| d.get(MANIFESTS_KEY))
        .ok_or_else(|| {
            PhaseError::error(
                PROVIDER_INSTALLED_CONDITION,
                reasons::COMPONENTS_FETCH_ERROR,
                Error::validation(format!(
                    "configmap {}/{} has no {} key",
                    namespace, reference.name, MANIFESTS_KEY
                )),
            )
        })?;
    parse_components(text.as_bytes(), &scope.variables).map_err(fetch_failure)
}

/// Render the components and run the transformer pipeline
pub(super) async fn fetch(scope: &mut ProviderScope, ctx: &Context) -> Result<PhaseResult, PhaseError> {
    let mut objects = {
        let (repository, version) = loaded(scope)?;
        let raw = repository.components(version).map_err(fetch_failure)?;
        let mut objects = parse_components(raw, &scope.variables).map_err(fetch_failure)?;
        if let Ok(extra) = repository.get_file(version, MANIFESTS_KEY) {
            objects.extend(parse_components(extra, &scope.variables).map_err(fetch_failure)?);
        }
        objects
    };
    objects.extend(additional_manifests(scope, ctx).await?);

    let mut scopes = ctx.ops.resource_scopes().await.map_err(fetch_failure)?;
    scopes.learn_from_crds(objects.iter().map(ManifestObject::value));

    let component = scope.component_name();
    let image_override = ctx.config.image_override_for(&component);
    transform_components(&mut objects, &scope.provider, &scopes, image_override.as_ref()).map_err(|e| {
        let reason = Stage::of(&e)
            .map(|stage| stage.reason())
            .unwrap_or(reasons::COMPONENTS_CUSTOMIZATION_ERROR);
        PhaseError::error(PROVIDER_INSTALLED_CONDITION, reason, e)
    })?;
    add_managed_labels(&mut objects, &component);

    debug!(provider = %scope.provider.key(), objects = objects.len(), "components rendered");
    scope.components = objects;
    Ok(PhaseResult::proceed())
}

/// Remove objects the new version no longer ships
pub(super) async fn upgrade(scope: &mut ProviderScope, ctx: &Context) -> Result<PhaseResult, PhaseError> {
    let (_, target) = loaded(scope)?;
    let Some(installed) = scope.provider.installed_version() else {
        return Ok(PhaseResult::proceed());
    };
    if same_version(installed, target) {
        return Ok(PhaseResult::proceed());
    }
    info!(
        provider = %scope.provider.key(),
        from = installed,
        to = target,
        "upgrading provider"
    );
    scope.upgrading = true;

    let installer = Installer::new(ctx.ops.as_ref(), ctx.config.provider_ready_timeout, &ctx.cancel);
    installer
        .remove_stale(&scope.component_name(), &scope.components)
        .await
        .map_err(|e| {
            PhaseError::warning(
                PROVIDER_UPGRADED_CONDITION,
                reasons::OLD_COMPONENTS_DELETION_ERROR,
                e,
            )
        })?;
    Ok(PhaseResult::proceed())
}

/// Apply the components and wait for them to become ready
pub(super) async fn install(scope: &mut ProviderScope, ctx: &Context) -> Result<PhaseResult, PhaseError> {
    let version = loaded(scope)?.1.to_string();
    let installer = Installer::new(ctx.ops.as_ref(), ctx.config.provider_ready_timeout, &ctx.cancel)
        .with_poll(ctx.readiness_poll.clone());
    let reference = object_reference(&scope.provider);

    if let Err(e) = installer.install(&scope.components).await {
        let message = format!("Install failed: {}", e.message());
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                event_reasons::INSTALL_FAILED,
                actions::RECONCILE,
                Some(message.clone()),
            )
            .await;
        let source = Error::install_for_provider(scope.provider.key(), message);
        return Err(if scope.upgrading {
            PhaseError::warning(PROVIDER_UPGRADED_CONDITION, reasons::COMPONENTS_UPGRADE_ERROR, source)
        } else {
            PhaseError::warning(PROVIDER_INSTALLED_CONDITION, reasons::COMPONENTS_INSTALL_ERROR, source)
        });
    }

    let conditions = &mut scope.provider.status.conditions;
    set_condition(conditions, Condition::true_condition(PROVIDER_INSTALLED_CONDITION));
    if scope.upgrading {
        set_condition(conditions, Condition::true_condition(PROVIDER_UPGRADED_CONDITION));
    }
    scope.provider.status.installed_version = Some(version.clone());
    scope.provider.status.contract = scope.contract.clone();

    if let Err(e) = ctx
        .ops
        .set_annotation(&scope.provider, APPLIED_SPEC_HASH_ANNOTATION, &scope.spec_hash)
        .await
    {
        warn!(provider = %scope.provider.key(), error = %e, "failed to record applied spec hash");
    }

    let (reason, action) = if scope.upgrading {
        (event_reasons::PROVIDER_UPGRADED, actions::UPGRADE)
    } else {
        (event_reasons::PROVIDER_INSTALLED, actions::RECONCILE)
    };
    ctx.events
        .publish(
            &reference,
            EventType::Normal,
            reason,
            action,
            Some(format!("{} {} is ready", scope.component_name(), version)),
        )
        .await;
    info!(provider = %scope.provider.key(), version = %version, "provider installed");
    Ok(PhaseResult::proceed())
}

/// Summarize a successful reconcile into Ready=True
pub(super) fn report_status(scope: &mut ProviderScope) -> Result<PhaseResult, PhaseError> {
    set_condition(
        &mut scope.provider.status.conditions,
        Condition::true_condition(READY_CONDITION),
    );
    Ok(PhaseResult::proceed())
}
