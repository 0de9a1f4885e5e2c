//! Dataset CRD
//!
//! A Dataset runs a loader container that writes one file into the cloud
//! artifact bucket. The resulting URL is recorded in status and mounted
//! read-only by Models that train on it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComputeResources, ContainerSpec, Params, ResourceStatus};

/// Desired state of a Dataset
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1alpha1",
    kind = "Dataset",
    plural = "datasets",
    namespaced,
    status = "ResourceStatus",
    category = "ai",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    /// Container that loads the data
    pub container: ContainerSpec,

    /// Name of the file the loader writes (e.g. `train.jsonl`)
    pub filename: String,

    /// Compute resources for the loader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComputeResources>,

    /// Parameters passed to the loader as `PARAM_*` environment variables
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
}

impl DatasetSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        self.container.validate()?;
        if self.filename.trim().is_empty() {
            return Err("filename must not be empty".to_string());
        }
        if self.filename.contains('/') {
            return Err("filename must not contain '/'".to_string());
        }
        Ok(())
    }
}
