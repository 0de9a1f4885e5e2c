//! Kubernetes access for the reconcilers
//!
//! Everything the controller reads or writes goes through [`KubeClient`] so the
//! reconcilers can be driven against mocks in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use kiln_common::crd::{Dataset, Managed, ManagedResource, Model, ResourceKind, ResourceStatus, Server};
use kiln_common::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for Kiln resources
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a managed resource; `None` if it no longer exists
    async fn get_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedResource>, Error>;

    /// Replace the status subresource of a managed resource
    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        status: &ResourceStatus,
    ) -> Result<(), Error>;

    /// Create a Job. An existing Job with the same name is reported as a 409
    /// error, not swallowed.
    async fn create_job(&self, job: &Job) -> Result<(), Error>;

    /// Fetch a Job; `None` if it does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// Server-side apply a ServiceAccount
    async fn apply_service_account(&self, service_account: &ServiceAccount) -> Result<(), Error>;

    /// Server-side apply a Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Server-side apply a Service
    async fn apply_service(&self, service: &Service) -> Result<(), Error>;

    /// Fetch a Deployment; `None` if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_managed<K>(&self, namespace: &str, name: &str) -> Result<Option<ManagedResource>, Error>
    where
        K: Managed + Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Debug,
    {
        let api: Api<K> = self.api(namespace);
        Ok(api.get_opt(name).await?.map(Managed::into_managed))
    }

    async fn patch_managed_status<K>(
        &self,
        namespace: &str,
        name: &str,
        status: &ResourceStatus,
    ) -> Result<(), Error>
    where
        K: Managed + Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Debug,
    {
        let api: Api<K> = self.api(namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }

    async fn apply<K>(&self, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let meta = obj.meta();
        let (Some(name), Some(namespace)) = (meta.name.as_deref(), meta.namespace.as_deref()) else {
            return Err(Error::internal_with_context(
                "apply",
                "object to apply needs a name and namespace",
            ));
        };
        let api: Api<K> = self.api(namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedResource>, Error> {
        match kind {
            ResourceKind::Dataset => self.get_managed::<Dataset>(namespace, name).await,
            ResourceKind::Model => self.get_managed::<Model>(namespace, name).await,
            ResourceKind::Server => self.get_managed::<Server>(namespace, name).await,
        }
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        status: &ResourceStatus,
    ) -> Result<(), Error> {
        match kind {
            ResourceKind::Dataset => {
                self.patch_managed_status::<Dataset>(namespace, name, status)
                    .await
            }
            ResourceKind::Model => {
                self.patch_managed_status::<Model>(namespace, name, status)
                    .await
            }
            ResourceKind::Server => {
                self.patch_managed_status::<Server>(namespace, name, status)
                    .await
            }
        }
    }

    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        let namespace = job.metadata.namespace.as_deref().ok_or_else(|| {
            Error::internal_with_context("job", "job to create has no namespace")
        })?;
        let api: Api<Job> = self.api(namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_service_account(&self, service_account: &ServiceAccount) -> Result<(), Error> {
        self.apply(service_account).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.apply(deployment).await
    }

    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        self.apply(service).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }
}
