//! Error types for cloud-control backends

use thiserror::Error;
use tonic::{Code, Status};

/// Result alias for backend operations
pub type Result<T> = std::result::Result<T, SciError>;

/// Backend error, mapped onto a gRPC status at the service boundary
#[derive(Debug, Error)]
pub enum SciError {
    /// The request is malformed
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What is wrong
        message: String,
    },

    /// The principal, role or object does not exist
    #[error("not found: {message}")]
    NotFound {
        /// What is missing
        message: String,
    },

    /// A concurrent writer changed the policy; retries exhausted
    #[error("conflict: {message}")]
    Conflict {
        /// Error message
        message: String,
    },

    /// The object exists but cannot give a usable answer
    #[error("failed precondition: {message}")]
    FailedPrecondition {
        /// Error message
        message: String,
    },

    /// Credentials or the cloud API could not be reached
    #[error("unavailable: {message}")]
    Unavailable {
        /// Error message
        message: String,
    },

    /// The cloud API answered with an unexpected status
    #[error("upstream error ({status}): {message}")]
    Upstream {
        /// HTTP status from the cloud API
        status: u16,
        /// Response body or summary
        message: String,
    },
}

impl SciError {
    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument { message: msg.into() }
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound { message: msg.into() }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict { message: msg.into() }
    }

    /// Create a failed-precondition error
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition { message: msg.into() }
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable { message: msg.into() }
    }

    /// Classify a non-success HTTP response from a cloud API
    pub fn from_http(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            404 => Self::NotFound { message },
            409 => Self::Conflict { message },
            _ => Self::Upstream { status, message },
        }
    }

    /// gRPC code for this error
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument { .. } => Code::InvalidArgument,
            Self::NotFound { .. } => Code::NotFound,
            Self::Conflict { .. } => Code::Aborted,
            Self::FailedPrecondition { .. } => Code::FailedPrecondition,
            Self::Unavailable { .. } => Code::Unavailable,
            Self::Upstream { status, .. } => match status {
                400 => Code::InvalidArgument,
                401 => Code::Unauthenticated,
                403 => Code::PermissionDenied,
                429 => Code::ResourceExhausted,
                500..=599 => Code::Unavailable,
                _ => Code::Internal,
            },
        }
    }
}

impl From<reqwest::Error> for SciError {
    fn from(e: reqwest::Error) -> Self {
        Self::unavailable(e.to_string())
    }
}

impl From<gcp_auth::Error> for SciError {
    fn from(e: gcp_auth::Error) -> Self {
        Self::unavailable(format!("GCP authentication: {}", e))
    }
}

impl From<serde_json::Error> for SciError {
    fn from(e: serde_json::Error) -> Self {
        Self::Upstream {
            status: 0,
            message: format!("malformed response: {}", e),
        }
    }
}

impl From<SciError> for Status {
    fn from(e: SciError) -> Self {
        Status::new(e.code(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_map_to_grpc_codes() {
        assert_eq!(SciError::from_http(404, "gone").code(), Code::NotFound);
        assert_eq!(SciError::from_http(409, "etag").code(), Code::Aborted);
        assert_eq!(SciError::from_http(403, "denied").code(), Code::PermissionDenied);
        assert_eq!(SciError::from_http(503, "later").code(), Code::Unavailable);
        assert_eq!(SciError::from_http(418, "teapot").code(), Code::Internal);
    }

    #[test]
    fn status_carries_message() {
        let status: Status = SciError::invalid_argument("principal is required").into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("principal is required"));
    }
}
