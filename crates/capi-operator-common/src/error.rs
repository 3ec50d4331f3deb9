//! Error types for the provider operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to map it onto a provider
//! condition: which provider, which source, which pipeline stage.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provider operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a provider spec
    #[error("validation error for {provider}: {message}")]
    Validation {
        /// Name of the provider with invalid configuration
        provider: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.fetchConfig")
        field: Option<String>,
    },

    /// Artifact fetch failure (GitHub, OCI, ConfigMap repository)
    #[error("fetch error [{source_kind}]: {message}")]
    Fetch {
        /// Kind of artifact source (github, oci, configmap)
        source_kind: String,
        /// Description of what failed
        message: String,
        /// HTTP status code if the failure came from an HTTP response
        status: Option<u16>,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A requested item does not exist (repository version, file, object)
    #[error("not found: {message}")]
    NotFound {
        /// What was not found
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Component transformation failure
    #[error("transform error [{stage}]: {message}")]
    Transform {
        /// Pipeline stage that failed (namespace, deployment, patch, image)
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// Installation, upgrade or deletion failure
    #[error("install error: {message}")]
    Install {
        /// Description of what failed
        message: String,
        /// Provider being installed (if applicable)
        provider: Option<String>,
    },

    /// A wait exceeded its deadline or was interrupted
    #[error("timeout: {message}")]
    Timeout {
        /// Description of what was being waited for
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "registry", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            provider: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with provider context and field path
    pub fn validation_for_field(
        provider: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            provider: provider.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable fetch error
    pub fn fetch(source_kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            source_kind: source_kind.into(),
            message: msg.into(),
            status: None,
            retryable: true,
        }
    }

    /// Create a fetch error from an HTTP status code.
    ///
    /// Client errors (4xx) other than 408/429 are permanent.
    pub fn fetch_status(source_kind: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        let retryable = !(400..500).contains(&status) || status == 408 || status == 429;
        Self::Fetch {
            source_kind: source_kind.into(),
            message: msg.into(),
            status: Some(status),
            retryable,
        }
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a transform error for a pipeline stage
    pub fn transform(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transform {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create an install error with the given message
    pub fn install(msg: impl Into<String>) -> Self {
        Self::Install {
            message: msg.into(),
            provider: None,
        }
    }

    /// Create an install error for a specific provider
    pub fn install_for_provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Install {
            message: msg.into(),
            provider: Some(provider.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and transform errors need a spec change.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Fetch { retryable, .. } => *retryable,
            Error::NotFound { .. } => true,
            Error::Serialization { .. } => false,
            Error::Transform { .. } => false,
            Error::Install { .. } => true,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this is a Kubernetes 404 or a repository miss
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// The bare message without the category prefix, for condition messages
    pub fn message(&self) -> String {
        match self {
            Error::Kube { source } => source.to_string(),
            Error::Validation { message, .. }
            | Error::Fetch { message, .. }
            | Error::NotFound { message }
            | Error::Serialization { message, .. }
            | Error::Transform { message, .. }
            | Error::Install { message, .. }
            | Error::Timeout { message }
            | Error::Internal { message, .. } => message.clone(),
        }
    }

    /// HTTP status code, if this error came from an HTTP response
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Fetch { status, .. } => *status,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }
}
