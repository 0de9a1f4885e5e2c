//! `CloudControl` gRPC server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use kiln_proto::cloud_control_server::{CloudControl, CloudControlServer};
use kiln_proto::{
    BindIdentityRequest, BindIdentityResponse, GetObjectChecksumRequest, GetObjectChecksumResponse,
};

use crate::backend::Backend;
use crate::error::{Result, SciError};

/// gRPC server wrapping one cloud backend
pub struct SciServer<B: Backend> {
    backend: Arc<B>,
    addr: SocketAddr,
}

impl<B: Backend> SciServer<B> {
    /// Create a server for `backend` listening on `addr`
    pub fn new(backend: Arc<B>, addr: SocketAddr) -> Self {
        Self { backend, addr }
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.addr;
        let service = SciService::new(self.backend);

        info!(?addr, "Starting cloud-control gRPC server");

        tonic::transport::Server::builder()
            .add_service(CloudControlServer::new(service))
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| SciError::unavailable(format!("server error: {}", e)))
    }
}

/// Request validation and error mapping in front of a [`Backend`]
pub struct SciService<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> SciService<B> {
    /// Wrap a backend
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

fn require(value: &str, field: &str) -> std::result::Result<(), Status> {
    if value.trim().is_empty() {
        return Err(SciError::invalid_argument(format!("{} is required", field)).into());
    }
    Ok(())
}

#[tonic::async_trait]
impl<B: Backend> CloudControl for SciService<B> {
    #[instrument(skip_all, fields(principal = %request.get_ref().principal))]
    async fn bind_identity(
        &self,
        request: Request<BindIdentityRequest>,
    ) -> std::result::Result<Response<BindIdentityResponse>, Status> {
        let req = request.into_inner();
        require(&req.principal, "principal")?;
        require(&req.kubernetes_namespace, "kubernetes_namespace")?;
        require(&req.kubernetes_service_account, "kubernetes_service_account")?;

        self.backend
            .bind_identity(
                &req.principal,
                &req.kubernetes_namespace,
                &req.kubernetes_service_account,
            )
            .await
            .map_err(|e| {
                warn!(error = %e, "bind identity failed");
                Status::from(e)
            })?;

        info!(
            namespace = %req.kubernetes_namespace,
            service_account = %req.kubernetes_service_account,
            "identity bound"
        );
        Ok(Response::new(BindIdentityResponse {}))
    }

    #[instrument(skip_all, fields(bucket = %request.get_ref().bucket_name, object = %request.get_ref().object_name))]
    async fn get_object_checksum(
        &self,
        request: Request<GetObjectChecksumRequest>,
    ) -> std::result::Result<Response<GetObjectChecksumResponse>, Status> {
        let req = request.into_inner();
        require(&req.bucket_name, "bucket_name")?;
        require(&req.object_name, "object_name")?;

        let md5_checksum = self
            .backend
            .get_object_checksum(&req.bucket_name, &req.object_name)
            .await
            .map_err(|e| {
                warn!(error = %e, "checksum lookup failed");
                Status::from(e)
            })?;

        Ok(Response::new(GetObjectChecksumResponse { md5_checksum }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use mockall::predicate::eq;
    use tonic::Code;

    fn bind_request(principal: &str, ns: &str, sa: &str) -> Request<BindIdentityRequest> {
        Request::new(BindIdentityRequest {
            principal: principal.to_string(),
            kubernetes_namespace: ns.to_string(),
            kubernetes_service_account: sa.to_string(),
        })
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_before_the_backend() {
        let service = SciService::new(Arc::new(MockBackend::new()));

        let status = service
            .bind_identity(bind_request("", "ml", "data-loader"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("principal"));

        let status = service
            .get_object_checksum(Request::new(GetObjectChecksumRequest {
                bucket_name: "b".to_string(),
                object_name: " ".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn bind_is_forwarded_to_backend() {
        let mut backend = MockBackend::new();
        backend
            .expect_bind_identity()
            .with(eq("role"), eq("ml"), eq("modeller"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let service = SciService::new(Arc::new(backend));
        assert!(service
            .bind_identity(bind_request("role", "ml", "modeller"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn backend_errors_become_statuses() {
        let mut backend = MockBackend::new();
        backend
            .expect_get_object_checksum()
            .returning(|_, _| Err(SciError::not_found("no such object")));

        let service = SciService::new(Arc::new(backend));
        let status = service
            .get_object_checksum(Request::new(GetObjectChecksumRequest {
                bucket_name: "b".to_string(),
                object_name: "o".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }
}
