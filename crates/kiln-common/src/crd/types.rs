//! Shared spec and status types used by every Kiln resource kind

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{self, Condition};

// =============================================================================
// Container
// =============================================================================

/// Where the container image for a resource comes from.
///
/// Exactly one of `image` or `git` must be set. With `git`, the controller
/// builds and pushes an image before any other stage runs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Prebuilt container image reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Git repository to build the image from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
}

impl ContainerSpec {
    /// Container spec that uses a prebuilt image
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            git: None,
        }
    }

    /// Validate that exactly one image source is configured
    pub fn validate(&self) -> Result<(), String> {
        match (&self.image, &self.git) {
            (Some(image), None) if image.trim().is_empty() => {
                Err("container image must not be empty".to_string())
            }
            (Some(_), None) => Ok(()),
            (None, Some(git)) if git.url.trim().is_empty() => {
                Err("container git url must not be empty".to_string())
            }
            (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err("container image and git are mutually exclusive".to_string()),
            (None, None) => Err("container requires either image or git".to_string()),
        }
    }
}

/// Git source for an image build
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    /// Repository URL (https)
    pub url: String,

    /// Directory inside the repository containing the Dockerfile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Branch to build (defaults to `main`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

// =============================================================================
// Resources
// =============================================================================

/// Compute resources for the container running a stage
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComputeResources {
    /// CPU cores
    #[serde(default = "default_cpu")]
    pub cpu: i64,

    /// Memory in GiB
    #[serde(default = "default_memory")]
    pub memory: i64,

    /// Ephemeral disk in GiB
    #[serde(default = "default_disk")]
    pub disk: i64,

    /// GPU request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuSpec>,
}

fn default_cpu() -> i64 {
    2
}

fn default_memory() -> i64 {
    10
}

fn default_disk() -> i64 {
    10
}

impl Default for ComputeResources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            disk: default_disk(),
            gpu: None,
        }
    }
}

/// GPU request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GpuSpec {
    /// GPU type (e.g. nvidia-l4). Node placement for a type is decided by the
    /// cluster's scheduling setup, not by Kiln.
    #[serde(rename = "type")]
    pub type_: String,

    /// Number of GPUs
    pub count: i64,
}

// =============================================================================
// References and params
// =============================================================================

/// Reference to another Kiln resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ObjectRef {
    /// Name of the referenced resource
    pub name: String,

    /// Namespace of the referenced resource (defaults to the referrer's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Reference a resource in the referrer's namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Namespace of the target, falling back to `default_ns`
    pub fn namespace_or<'a>(&'a self, default_ns: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_ns)
    }
}

/// Parameter value passed to a stage container as an environment variable
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    /// Integer parameter
    Int(i64),
    /// String parameter
    String(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
        }
    }
}

/// Stage parameters, keyed by name
pub type Params = BTreeMap<String, ParamValue>;

// =============================================================================
// Status
// =============================================================================

/// Observed state shared by Dataset, Model and Server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Whether every required condition is true
    #[serde(default)]
    pub ready: bool,

    /// Per-stage conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// URL of the produced artifact; empty until the producing job succeeds
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Content checksum of the artifact (hex md5), when verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Generation the controller last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ResourceStatus {
    /// Upsert a condition (see [`conditions::set_condition`])
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        conditions::set_condition(&mut self.conditions, type_, status, reason, message)
    }

    /// True iff the condition is present and `True`
    pub fn is_condition_true(&self, type_: &str) -> bool {
        conditions::is_true(&self.conditions, type_)
    }

    /// True iff every required condition is present and `True`
    pub fn all_ready(&self, required: &[&str]) -> bool {
        conditions::all_ready(&self.conditions, required)
    }

    /// True once an artifact URL has been recorded
    pub fn has_url(&self) -> bool {
        !self.url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_requires_exactly_one_source() {
        assert!(ContainerSpec::image("ghcr.io/acme/loader:v1").validate().is_ok());
        assert!(ContainerSpec::default().validate().is_err());

        let both = ContainerSpec {
            image: Some("x".to_string()),
            git: Some(GitSource {
                url: "https://github.com/acme/loader".to_string(),
                ..Default::default()
            }),
        };
        assert!(both.validate().unwrap_err().contains("mutually exclusive"));

        let empty = ContainerSpec::image("  ");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn params_accept_ints_and_strings() {
        let params: Params =
            serde_json::from_str(r#"{"epochs": 3, "optimizer": "adam"}"#).unwrap();
        assert_eq!(params["epochs"], ParamValue::Int(3));
        assert_eq!(params["optimizer"].to_string(), "adam");
    }

    #[test]
    fn resources_default_when_fields_missing() {
        let r: ComputeResources = serde_json::from_str(r#"{"gpu": {"type": "nvidia-l4", "count": 1}}"#).unwrap();
        assert_eq!(r.cpu, 2);
        assert_eq!(r.memory, 10);
        assert_eq!(r.gpu.unwrap().count, 1);
    }

    #[test]
    fn object_ref_namespace_fallback() {
        let local = ObjectRef::new("mnist");
        assert_eq!(local.namespace_or("ml"), "ml");

        let remote = ObjectRef {
            name: "mnist".to_string(),
            namespace: Some("shared".to_string()),
        };
        assert_eq!(remote.namespace_or("ml"), "shared");
    }

    #[test]
    fn empty_url_is_omitted_from_status() {
        let status = ResourceStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("url").is_none());
        assert_eq!(json["ready"], false);
        assert!(!status.has_url());
    }
}
