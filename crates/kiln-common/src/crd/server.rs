//! Server CRD
//!
//! A Server serves a Ready Model behind a Deployment and a ClusterIP Service.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComputeResources, ContainerSpec, ObjectRef, Params, ResourceStatus};

/// Port the serving container listens on
pub const SERVER_PORT: i32 = 8080;

/// Desired state of a Server
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1alpha1",
    kind = "Server",
    plural = "servers",
    namespaced,
    status = "ResourceStatus",
    category = "ai",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Container with the serving code
    pub container: ContainerSpec,

    /// Model to serve
    pub model: ObjectRef,

    /// Compute resources per replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComputeResources>,

    /// Parameters passed as `PARAM_*` environment variables
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
}

impl ServerSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        self.container.validate()?;
        if self.model.name.trim().is_empty() {
            return Err("model.name must not be empty".to_string());
        }
        Ok(())
    }
}
