//! Custom Resource Definitions for Kiln

mod dataset;
mod managed;
mod model;
mod server;
mod types;

pub use dataset::{Dataset, DatasetSpec};
pub use managed::{Managed, ManagedResource, ResourceKind};
pub use model::{Model, ModelSpec};
pub use server::{Server, ServerSpec, SERVER_PORT};
pub use types::{
    ComputeResources, ContainerSpec, GitSource, GpuSpec, ObjectRef, ParamValue, Params,
    ResourceStatus,
};
