//! Shared fixtures for reconciler tests

use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job, JobStatus};
use mockall::mock;

use kiln_cloud::{Cloud, GcpCloud, SciClient};
use kiln_common::crd::{ContainerSpec, Dataset, DatasetSpec, Model, ModelSpec, ObjectRef, Params};
use kiln_common::Result;

use crate::context::Context;
use crate::kube_client::MockKubeClient;

mock! {
    pub Sci {}

    #[async_trait::async_trait]
    impl SciClient for Sci {
        async fn bind_identity(
            &self,
            principal: &str,
            namespace: &str,
            service_account: &str,
        ) -> Result<()>;
        async fn get_object_checksum(&self, bucket: &str, object: &str) -> Result<String>;
    }
}

pub const NAMESPACE: &str = "ml";
pub const PROJECT: &str = "acme-ml";
pub const BUCKET: &str = "acme-ml-kiln-artifacts";

pub fn gcp(sci: MockSci) -> Arc<dyn Cloud> {
    Arc::new(GcpCloud::new(PROJECT, None, Arc::new(sci)))
}

pub fn context(kube: MockKubeClient, sci: MockSci) -> Arc<Context> {
    Arc::new(Context::for_testing(Arc::new(kube), gcp(sci)))
}

pub fn dataset(name: &str, uid: &str) -> Dataset {
    let mut ds = Dataset::new(
        name,
        DatasetSpec {
            container: ContainerSpec::image("ghcr.io/acme/loader:v1"),
            filename: "train.jsonl".to_string(),
            resources: None,
            params: Params::new(),
        },
    );
    ds.metadata.namespace = Some(NAMESPACE.to_string());
    ds.metadata.uid = Some(uid.to_string());
    ds.metadata.generation = Some(1);
    ds
}

pub fn model(name: &str, uid: &str, training_dataset: Option<&str>) -> Model {
    let mut model = Model::new(
        name,
        ModelSpec {
            container: ContainerSpec::image("ghcr.io/acme/trainer:v1"),
            resources: None,
            base_model: None,
            training_dataset: training_dataset.map(ObjectRef::new),
            params: Params::new(),
        },
    );
    model.metadata.namespace = Some(NAMESPACE.to_string());
    model.metadata.uid = Some(uid.to_string());
    model.metadata.generation = Some(1);
    model
}

pub fn running_job() -> Job {
    Job {
        status: Some(JobStatus {
            active: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn succeeded_job() -> Job {
    Job {
        status: Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    }
}
