//! Error types for the Kiln control plane
//!
//! Errors carry enough context (resource, cloud, url) to be useful in logs and
//! in status conditions. Every variant knows whether retrying can help, which
//! is what separates a requeue with backoff from a terminal `Failed` condition.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Kiln operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource spec cannot be turned into a runnable workload
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with the invalid spec
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.container")
        field: Option<String>,
    },

    /// An artifact URL could not be parsed
    #[error("invalid artifact url {url:?}: {message}")]
    UrlParse {
        /// The offending URL
        url: String,
        /// What is wrong with it
        message: String,
    },

    /// Cloud backend error (reported over the cloud-control RPC boundary)
    #[error("cloud error [{cloud}]: {message}")]
    Cloud {
        /// Cloud identifier (gcp, aws)
        cloud: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "job")
        context: String,
    },
}

impl Error {
    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named resource and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a URL parse error
    pub fn url_parse(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UrlParse {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a transient cloud error
    pub fn cloud(cloud: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            cloud: cloud.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a cloud error that retrying cannot fix (bad principal, missing bucket)
    pub fn cloud_permanent(cloud: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            cloud: cloud.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error
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
    /// Validation, URL and serialization errors need a spec change and are
    /// never retried. Kubernetes 4xx errors are terminal except conflicts
    /// (409) and throttling (429), which resolve on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::UrlParse { .. } => false,
            Error::Cloud { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for Kubernetes 404 responses
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True for Kubernetes 409 AlreadyExists responses (not update conflicts)
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// Machine-readable CamelCase reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::Validation { .. } => "InvalidSpec",
            Error::UrlParse { .. } => "MalformedURL",
            Error::Cloud { .. } => "CloudError",
            Error::Serialization { .. } => "SerializationError",
            Error::Internal { .. } => "InternalError",
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
