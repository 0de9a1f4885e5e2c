//! Client side of the `CloudControl` gRPC service

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

use kiln_common::{Error, Result};
use kiln_proto::cloud_control_client::CloudControlClient;
use kiln_proto::{BindIdentityRequest, GetObjectChecksumRequest};

use crate::cloud::CloudName;

/// Calls into the cloud-control backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SciClient: Send + Sync {
    /// Let `namespace/service_account` act as `principal`
    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<()>;

    /// Hex MD5 checksum of `bucket/object`
    async fn get_object_checksum(&self, bucket: &str, object: &str) -> Result<String>;
}

/// tonic-backed [`SciClient`]
///
/// The channel connects lazily, so constructing the client never blocks on the
/// backend being up. Every call carries the configured timeout.
#[derive(Clone)]
pub struct GrpcSciClient {
    cloud: CloudName,
    client: CloudControlClient<Channel>,
}

impl GrpcSciClient {
    /// Create a client for the backend at `address` (e.g. `http://kiln-sci:10443`)
    pub fn connect_lazy(cloud: CloudName, address: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(address.to_string())
            .map_err(|e| Error::validation(format!("invalid cloud-control address {}: {}", address, e)))?
            .timeout(timeout)
            .connect_timeout(timeout);

        debug!(%cloud, address, "created lazy cloud-control channel");
        Ok(Self {
            cloud,
            client: CloudControlClient::new(endpoint.connect_lazy()),
        })
    }
}

#[async_trait]
impl SciClient for GrpcSciClient {
    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<()> {
        let request = BindIdentityRequest {
            principal: principal.to_string(),
            kubernetes_namespace: namespace.to_string(),
            kubernetes_service_account: service_account.to_string(),
        };
        self.client
            .clone()
            .bind_identity(request)
            .await
            .map_err(|s| status_to_error(self.cloud, &s))?;
        Ok(())
    }

    async fn get_object_checksum(&self, bucket: &str, object: &str) -> Result<String> {
        let request = GetObjectChecksumRequest {
            bucket_name: bucket.to_string(),
            object_name: object.to_string(),
        };
        let response = self
            .client
            .clone()
            .get_object_checksum(request)
            .await
            .map_err(|s| status_to_error(self.cloud, &s))?;
        Ok(response.into_inner().md5_checksum)
    }
}

/// Map a gRPC status to a Kiln error
///
/// Caller mistakes and authorization failures will not fix themselves and are
/// permanent; everything else (unavailable, deadline, internal) is retried.
pub fn status_to_error(cloud: CloudName, status: &Status) -> Error {
    let message = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::InvalidArgument
        | Code::NotFound
        | Code::FailedPrecondition
        | Code::PermissionDenied
        | Code::Unauthenticated => Error::cloud_permanent(cloud.to_string(), message),
        _ => Error::cloud(cloud.to_string(), message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_permanent() {
        for code in [
            Code::InvalidArgument,
            Code::NotFound,
            Code::FailedPrecondition,
            Code::PermissionDenied,
            Code::Unauthenticated,
        ] {
            let err = status_to_error(CloudName::Gcp, &Status::new(code, "nope"));
            assert!(!err.is_retryable(), "{:?} should be permanent", code);
        }
    }

    #[test]
    fn transport_errors_are_retryable() {
        for code in [Code::Unavailable, Code::DeadlineExceeded, Code::Internal, Code::Aborted] {
            let err = status_to_error(CloudName::Aws, &Status::new(code, "later"));
            assert!(err.is_retryable(), "{:?} should be retryable", code);
            assert_eq!(err.reason(), "CloudError");
        }
    }

    #[test]
    fn rejects_invalid_address() {
        let result = GrpcSciClient::connect_lazy(CloudName::Gcp, "not a uri", Duration::from_secs(5));
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn unreachable_backend_is_retryable() {
        let client = GrpcSciClient::connect_lazy(
            CloudName::Gcp,
            "http://127.0.0.1:1",
            Duration::from_millis(500),
        )
        .unwrap();
        let err = client.get_object_checksum("b", "o").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
