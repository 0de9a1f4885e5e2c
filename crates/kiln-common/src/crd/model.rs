//! Model CRD
//!
//! A Model either imports weights (no training dataset) or trains on a
//! Dataset, optionally starting from a base Model. Both inputs are mounted
//! read-only from their artifact URLs; the output lands under the Model's own
//! uid-scoped prefix.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComputeResources, ContainerSpec, ObjectRef, Params, ResourceStatus};

/// Desired state of a Model
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kiln.dev",
    version = "v1alpha1",
    kind = "Model",
    plural = "models",
    namespaced,
    status = "ResourceStatus",
    category = "ai",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Container with the model code and dependencies
    pub container: ContainerSpec,

    /// Compute resources for the training / loading container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ComputeResources>,

    /// Model to mount as a starting point (transfer learning)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<ObjectRef>,

    /// Dataset to mount for training
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_dataset: Option<ObjectRef>,

    /// Parameters passed as `PARAM_*` environment variables
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
}

impl ModelSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        self.container.validate()?;
        for (field, reference) in [
            ("baseModel", &self.base_model),
            ("trainingDataset", &self.training_dataset),
        ] {
            if let Some(r) = reference {
                if r.name.trim().is_empty() {
                    return Err(format!("{}.name must not be empty", field));
                }
            }
        }
        Ok(())
    }

    /// True when this Model trains on a dataset rather than importing weights
    pub fn is_training(&self) -> bool {
        self.training_dataset.is_some()
    }
}
