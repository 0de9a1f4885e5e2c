//! Workload identity for stage pods
//!
//! Each stage runs as a generated service account annotated so the cloud
//! lets it act as a matching cloud principal. The service account is applied
//! first, then the binding is converged through the cloud-control backend.
//! Both steps are idempotent.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::debug;

use kiln_common::Error;

use crate::context::Context;
use crate::job::{MANAGED_BY, MANAGED_BY_LABEL};

/// Service account the Server Deployment runs as
pub const MODEL_SERVER_SERVICE_ACCOUNT: &str = "model-server";

/// Service account `name` in `namespace`, annotated for the context's cloud
pub fn service_account(ctx: &Context, namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY.to_string(),
            )])),
            annotations: Some(ctx.cloud.identity_annotations(name)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Apply the service account and bind it to its cloud principal
pub async fn ensure_identity(ctx: &Context, namespace: &str, name: &str) -> Result<(), Error> {
    ctx.kube
        .apply_service_account(&service_account(ctx, namespace, name))
        .await?;
    ctx.cloud.bind_identity(namespace, name).await?;
    debug!(namespace, service_account = name, "identity bound");
    Ok(())
}
