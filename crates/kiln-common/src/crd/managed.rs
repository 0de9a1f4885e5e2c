//! Uniform access to the three managed kinds
//!
//! Reconcilers share the container stage, job helpers and status handling.
//! [`Managed`] exposes the fields those shared paths need without caring
//! which kind they are looking at.

use std::fmt;

use kube::{Resource, ResourceExt};

use super::dataset::Dataset;
use super::model::Model;
use super::server::Server;
use super::types::{ComputeResources, ContainerSpec, Params, ResourceStatus};
use crate::conditions::{
    CONDITION_CONTAINER_READY, CONDITION_DATA_READY, CONDITION_MODEL_READY, CONDITION_SERVER_READY,
};

/// Kind of a managed resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Dataset
    Dataset,
    /// Model
    Model,
    /// Server
    Server,
}

impl ResourceKind {
    /// Kind name as it appears in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dataset => "Dataset",
            Self::Model => "Model",
            Self::Server => "Server",
        }
    }

    /// Lowercase kind name, used in object names and image tags
    pub fn lowercase(&self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Model => "model",
            Self::Server => "server",
        }
    }

    /// Conditions that must all be true for the resource to be Ready
    pub fn required_conditions(&self) -> &'static [&'static str] {
        match self {
            Self::Dataset => &[CONDITION_CONTAINER_READY, CONDITION_DATA_READY],
            Self::Model => &[CONDITION_CONTAINER_READY, CONDITION_MODEL_READY],
            Self::Server => &[CONDITION_CONTAINER_READY, CONDITION_SERVER_READY],
        }
    }

    /// Condition owned by the kind's main stage (after the container stage)
    pub fn primary_condition(&self) -> &'static str {
        match self {
            Self::Dataset => CONDITION_DATA_READY,
            Self::Model => CONDITION_MODEL_READY,
            Self::Server => CONDITION_SERVER_READY,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Kiln resource kind the controller reconciles
pub trait Managed: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    /// Kind of this resource
    const KIND: ResourceKind;

    /// Container spec
    fn container(&self) -> &ContainerSpec;

    /// Stage parameters
    fn params(&self) -> &Params;

    /// Requested compute resources, if any
    fn resources(&self) -> Option<&ComputeResources>;

    /// Observed status, if any has been written
    fn resource_status(&self) -> Option<&ResourceStatus>;

    /// Validate the spec
    fn validate(&self) -> Result<(), String>;

    /// Wrap into the kind-erased enum
    fn into_managed(self) -> ManagedResource;

    /// Unwrap from the kind-erased enum if the kind matches
    fn from_managed(resource: ManagedResource) -> Option<Self>;
}

macro_rules! impl_managed {
    ($ty:ident, $kind:ident) => {
        impl Managed for $ty {
            const KIND: ResourceKind = ResourceKind::$kind;

            fn container(&self) -> &ContainerSpec {
                &self.spec.container
            }

            fn params(&self) -> &Params {
                &self.spec.params
            }

            fn resources(&self) -> Option<&ComputeResources> {
                self.spec.resources.as_ref()
            }

            fn resource_status(&self) -> Option<&ResourceStatus> {
                self.status.as_ref()
            }

            fn validate(&self) -> Result<(), String> {
                self.spec.validate()
            }

            fn into_managed(self) -> ManagedResource {
                ManagedResource::$kind(self)
            }

            fn from_managed(resource: ManagedResource) -> Option<Self> {
                match resource {
                    ManagedResource::$kind(r) => Some(r),
                    _ => None,
                }
            }
        }
    };
}

impl_managed!(Dataset, Dataset);
impl_managed!(Model, Model);
impl_managed!(Server, Server);

/// Any one of the managed kinds
#[derive(Clone, Debug)]
pub enum ManagedResource {
    /// A Dataset
    Dataset(Dataset),
    /// A Model
    Model(Model),
    /// A Server
    Server(Server),
}

impl ManagedResource {
    /// Kind of the wrapped resource
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Dataset(_) => ResourceKind::Dataset,
            Self::Model(_) => ResourceKind::Model,
            Self::Server(_) => ResourceKind::Server,
        }
    }

    /// Name of the wrapped resource
    pub fn name(&self) -> String {
        match self {
            Self::Dataset(r) => r.name_any(),
            Self::Model(r) => r.name_any(),
            Self::Server(r) => r.name_any(),
        }
    }

    /// Observed status of the wrapped resource
    pub fn status(&self) -> Option<&ResourceStatus> {
        match self {
            Self::Dataset(r) => r.status.as_ref(),
            Self::Model(r) => r.status.as_ref(),
            Self::Server(r) => r.status.as_ref(),
        }
    }

    /// True iff the resource reports `ready: true`
    pub fn is_ready(&self) -> bool {
        self.status().map(|s| s.ready).unwrap_or(false)
    }

    /// Artifact URL, if one has been recorded
    pub fn url(&self) -> Option<&str> {
        self.status()
            .map(|s| s.url.as_str())
            .filter(|url| !url.is_empty())
    }
}
