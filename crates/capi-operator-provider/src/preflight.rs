//! Preflight checks run before any cluster mutation
//!
//! Checks short-circuit on the first failure. Every failure lands on the
//! `PreflightCheck` condition; its severity decides whether the dispatcher
//! waits for a spec change (Error), retries with backoff (Warning), or
//! requeues after a fixed delay (Info).

use capi_operator_common::crd::{
    reasons, ProviderObject, ProviderType, CORE_PROVIDER_NAME, PREFLIGHT_CHECK_CONDITION,
};
use capi_operator_common::Error;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::catalog::ProviderCatalog;
use crate::controller::Context;
use crate::phases::PhaseError;
use crate::sources::github::{verify_token, GitHubRelease};
use crate::sources::{secret_string_data, SourceCredentials};
use crate::version::{is_downgrade, parse_version};

fn fatal(reason: &'static str, source: Error) -> PhaseError {
    PhaseError::error(PREFLIGHT_CHECK_CONDITION, reason, source)
}

fn transient(source: Error) -> PhaseError {
    PhaseError::warning(PREFLIGHT_CHECK_CONDITION, reasons::RECONCILE_ERROR, source)
}

/// Run every check in order
pub async fn preflight(provider: &ProviderObject, ctx: &Context) -> Result<(), PhaseError> {
    check_version(provider)?;
    check_core_name(provider)?;

    let same_kind = ctx
        .ops
        .list_providers(provider.provider_type)
        .await
        .map_err(transient)?;
    check_unique(provider, &same_kind)?;

    check_fetch_config(provider, &ctx.config.catalog)?;
    check_github_token(provider, ctx).await?;

    if provider.provider_type != ProviderType::Core {
        let cores = ctx
            .ops
            .list_providers(ProviderType::Core)
            .await
            .map_err(transient)?;
        if !cores.iter().any(ProviderObject::is_ready) {
            return Err(PhaseError::info(
                PREFLIGHT_CHECK_CONDITION,
                reasons::WAITING_FOR_CORE_PROVIDER_READY,
                Error::not_found("Waiting for the CoreProvider to be installed and ready"),
            ));
        }
    }

    debug!(provider = %provider.key(), "preflight checks passed");
    Ok(())
}

/// `spec.version` parses, and does not move back a major or minor release
pub fn check_version(provider: &ProviderObject) -> Result<(), PhaseError> {
    let Some(desired) = provider.spec.desired_version() else {
        return Ok(());
    };
    let target = parse_version(desired).map_err(|e| fatal(reasons::INCORRECT_VERSION_FORMAT, e))?;

    let Some(installed) = provider.installed_version() else {
        return Ok(());
    };
    let Ok(installed_version) = parse_version(installed) else {
        return Ok(());
    };
    if is_downgrade(&installed_version, &target) {
        return Err(fatal(
            reasons::UNSUPPORTED_PROVIDER_DOWNGRADE,
            Error::validation(format!(
                "Downgrade is not supported: installed version {} is newer than requested version {}",
                installed, desired
            )),
        ));
    }
    Ok(())
}

/// A CoreProvider must be named `cluster-api`
pub fn check_core_name(provider: &ProviderObject) -> Result<(), PhaseError> {
    if provider.provider_type == ProviderType::Core && provider.name() != CORE_PROVIDER_NAME {
        return Err(fatal(
            reasons::INCORRECT_CORE_PROVIDER_NAME,
            Error::validation(format!(
                "Incorrect CoreProvider name: {}. It should be {}",
                provider.name(),
                CORE_PROVIDER_NAME
            )),
        ));
    }
    Ok(())
}

// Older first; objects without a creation timestamp sort last, ties break on namespace/name.
fn age_key(provider: &ProviderObject) -> (bool, Option<DateTime<Utc>>, &str, &str) {
    let created = provider.metadata.creation_timestamp.as_ref().map(|t| t.0);
    (created.is_none(), created, provider.namespace(), provider.name())
}

/// The older instance that `provider` conflicts with, if any.
///
/// Any other CoreProvider conflicts; other kinds conflict on equal names.
/// The oldest instance wins so that exactly one of a conflicting set passes.
pub fn find_conflict<'a>(
    provider: &ProviderObject,
    same_kind: &'a [ProviderObject],
) -> Option<&'a ProviderObject> {
    same_kind
        .iter()
        .filter(|other| other.key() != provider.key())
        .filter(|other| provider.provider_type == ProviderType::Core || other.name() == provider.name())
        .filter(|other| age_key(other) < age_key(provider))
        .min_by(|a, b| age_key(a).cmp(&age_key(b)))
}

/// Only one instance per Core, and per name for other kinds
pub fn check_unique(provider: &ProviderObject, same_kind: &[ProviderObject]) -> Result<(), PhaseError> {
    let Some(existing) = find_conflict(provider, same_kind) else {
        return Ok(());
    };
    let kind = provider.provider_type.kind();
    let message = if provider.provider_type == ProviderType::Core {
        format!(
            "There is already a {} {} in namespace {}; only one {} is allowed, remove {} from namespace {}",
            kind,
            existing.name(),
            existing.namespace(),
            kind,
            provider.name(),
            provider.namespace()
        )
    } else {
        format!(
            "There is already a {} with name {} in namespace {}; only one instance per name is allowed, remove {} from namespace {}",
            kind,
            existing.name(),
            existing.namespace(),
            provider.name(),
            provider.namespace()
        )
    };
    Err(fatal(
        reasons::MORE_THAN_ONE_PROVIDER_INSTANCE_EXISTS,
        Error::validation(message),
    ))
}

/// Exactly one source unless the catalog knows the provider; never more than one
pub fn check_fetch_config(provider: &ProviderObject, catalog: &ProviderCatalog) -> Result<(), PhaseError> {
    let populated = provider
        .spec
        .fetch_config
        .as_ref()
        .map_or(0, |f| f.populated());
    if populated > 1 {
        return Err(fatal(
            reasons::FETCH_CONFIG_VALIDATION_ERROR,
            Error::validation_for_field(
                provider.key(),
                "spec.fetchConfig",
                "Only one of Selector, OCI URL or provider URL must be provided",
            ),
        ));
    }
    if populated == 0 && !catalog.is_predefined(provider.provider_type, provider.name()) {
        return Err(fatal(
            reasons::FETCH_CONFIG_VALIDATION_ERROR,
            Error::validation_for_field(
                provider.key(),
                "spec.fetchConfig",
                "Either Selector, OCI URL or provider URL must be provided for a not predefined provider",
            ),
        ));
    }
    Ok(())
}

/// GitHub host the provider will download from, if its source is GitHub
fn github_host(provider: &ProviderObject, catalog: &ProviderCatalog) -> Option<String> {
    let fetch = provider.spec.fetch_config.clone().unwrap_or_default();
    if fetch.oci.is_some() || fetch.selector.is_some() {
        return None;
    }
    let url = match fetch.url {
        Some(url) => url,
        None => catalog.lookup(provider.provider_type, provider.name())?.url.clone(),
    };
    GitHubRelease::parse(&url).ok().map(|release| release.host)
}

/// Check the GitHub token from the config secret against the API.
///
/// Rejected tokens are fatal. Any other failure of the check is left for
/// the download to report.
async fn check_github_token(provider: &ProviderObject, ctx: &Context) -> Result<(), PhaseError> {
    let Some(reference) = &provider.spec.config_secret else {
        return Ok(());
    };
    let Some(host) = github_host(provider, &ctx.config.catalog) else {
        return Ok(());
    };
    let namespace = reference.namespace.as_deref().unwrap_or(provider.namespace());
    let secret = match ctx.ops.get_secret(&reference.name, namespace).await {
        Ok(Some(secret)) => secret,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!(provider = %provider.key(), error = %e, "cannot read config secret for token check");
            return Ok(());
        }
    };
    let Some(token) = SourceCredentials::from_data(&secret_string_data(&secret)).github_token else {
        return Ok(());
    };

    match verify_token(ctx.http.as_ref(), &host, &token, &ctx.retry).await {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.http_status(), Some(401 | 403)) => Err(fatal(
            reasons::INVALID_GITHUB_TOKEN,
            Error::validation(format!(
                "GitHub token in secret {}/{} was rejected: {}",
                namespace,
                reference.name,
                e.message()
            )),
        )),
        Err(e) => {
            warn!(provider = %provider.key(), error = %e, "GitHub token check failed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capi_operator_common::crd::{ConditionSeverity, FetchConfiguration, ProviderSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn infra(name: &str, namespace: &str, created_secs: i64) -> ProviderObject {
        let mut provider =
            ProviderObject::new(ProviderType::Infrastructure, name, namespace, ProviderSpec::default());
        provider.metadata.creation_timestamp = DateTime::from_timestamp(created_secs, 0).map(Time);
        provider
    }

    fn core(version: Option<&str>, installed: Option<&str>) -> ProviderObject {
        let mut provider = ProviderObject::new(
            ProviderType::Core,
            CORE_PROVIDER_NAME,
            "capi-system",
            ProviderSpec {
                version: version.map(str::to_string),
                ..Default::default()
            },
        );
        provider.status.installed_version = installed.map(str::to_string);
        provider
    }

    #[test]
    fn version_format_and_downgrade() {
        let err = check_version(&core(Some("one"), None)).unwrap_err();
        assert_eq!(err.reason, reasons::INCORRECT_VERSION_FORMAT);
        assert_eq!(err.message(), "could not parse \"one\" as version");
        assert_eq!(err.severity, ConditionSeverity::Error);

        let err = check_version(&core(Some("v1.9.0"), Some("v2.0.0"))).unwrap_err();
        assert_eq!(err.reason, reasons::UNSUPPORTED_PROVIDER_DOWNGRADE);

        assert!(check_version(&core(Some("v1.4.2"), Some("v1.4.3"))).is_ok());
        assert!(check_version(&core(Some("v1.5.0"), Some("v1.4.3"))).is_ok());
        assert!(check_version(&core(None, Some("v1.4.3"))).is_ok());
    }

    #[test]
    fn core_must_be_named_cluster_api() {
        let mut provider = core(None, None);
        assert!(check_core_name(&provider).is_ok());
        provider.metadata.name = Some("capi".to_string());
        let err = check_core_name(&provider).unwrap_err();
        assert_eq!(err.reason, reasons::INCORRECT_CORE_PROVIDER_NAME);
    }

    #[test]
    fn oldest_instance_wins() {
        let first = infra("aws", "ns1", 100);
        let second = infra("aws", "ns2", 200);
        let other = infra("azure", "ns0", 10);
        let all = vec![first.clone(), second.clone(), other];

        assert!(check_unique(&first, &all).is_ok());
        let err = check_unique(&second, &all).unwrap_err();
        assert_eq!(err.reason, reasons::MORE_THAN_ONE_PROVIDER_INSTANCE_EXISTS);
        assert!(err.message().contains("ns1"));
        assert!(err.message().contains("aws"));
        assert!(err.message().contains("ns2"));
    }

    #[test]
    fn equal_timestamps_break_on_namespace() {
        let a = infra("aws", "a", 100);
        let b = infra("aws", "b", 100);
        let all = vec![b.clone(), a.clone()];
        assert!(find_conflict(&a, &all).is_none());
        assert_eq!(find_conflict(&b, &all).map(ProviderObject::namespace), Some("a"));
    }

    #[test]
    fn any_other_core_conflicts() {
        let mut older = core(None, None);
        older.metadata.namespace = Some("old".to_string());
        older.metadata.creation_timestamp = DateTime::from_timestamp(1, 0).map(Time);
        let mut newer = core(None, None);
        newer.metadata.creation_timestamp = DateTime::from_timestamp(2, 0).map(Time);
        let all = vec![older.clone(), newer.clone()];
        assert!(check_unique(&older, &all).is_ok());
        assert!(check_unique(&newer, &all).is_err());
    }

    #[test]
    fn fetch_config_rules() {
        let catalog = ProviderCatalog::builtin();

        let custom = infra("my-custom-aws", "ns", 1);
        let err = check_fetch_config(&custom, &catalog).unwrap_err();
        assert_eq!(err.reason, reasons::FETCH_CONFIG_VALIDATION_ERROR);
        assert!(err.message().contains("Selector, OCI URL or provider URL"));

        assert!(check_fetch_config(&infra("aws", "ns", 1), &catalog).is_ok());

        let mut both = infra("aws", "ns", 1);
        both.spec.fetch_config = Some(FetchConfiguration {
            url: Some("https://github.com/org/repo/releases".to_string()),
            selector: Some(Default::default()),
            oci: None,
        });
        let err = check_fetch_config(&both, &catalog).unwrap_err();
        assert!(err.message().starts_with("Only one of"));
    }

    #[test]
    fn github_host_only_for_github_sources() {
        let catalog = ProviderCatalog::builtin();
        assert_eq!(github_host(&infra("aws", "ns", 1), &catalog).as_deref(), Some("github.com"));

        let mut oci = infra("aws", "ns", 1);
        oci.spec.fetch_config = Some(FetchConfiguration {
            oci: Some("ghcr.io/org/aws:v2.5.0".to_string()),
            ..Default::default()
        });
        assert_eq!(github_host(&oci, &catalog), None);
        assert_eq!(github_host(&infra("my-custom-aws", "ns", 1), &catalog), None);
    }
}
