//! Dataset reconciler: container → data-load
//!
//! The loader Job writes `<filename>` under `<uid>/data` on the artifact
//! bucket. Once it succeeds the object's checksum is verified through the
//! cloud backend and the URL is recorded; a recorded URL short-circuits the
//! stage on every later pass.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Container;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use kiln_common::conditions::CONDITION_DATA_READY;
use kiln_common::crd::{Dataset, ResourceStatus};
use kiln_common::{proceed, try_stage, Error, StageOutcome};

use crate::container::{reconcile_container, resolved_image};
use crate::context::Context;
use crate::identity::ensure_identity;
use crate::job::{build_job, ensure_job, env, job_name, param_env, resource_uid, JobStage};
use crate::lifecycle;

const LOADER_CONTAINER: &str = "loader";
const DATA_MOUNT: &str = "/data";
const LOGS_MOUNT: &str = "/dataset/logs";

/// Reconcile a Dataset
#[instrument(skip(dataset, ctx), fields(dataset = %dataset.name_any()))]
pub async fn reconcile(dataset: Arc<Dataset>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(dataset) = lifecycle::refetch(&ctx, dataset.as_ref()).await? else {
        info!("dataset no longer exists");
        return Ok(Action::await_change());
    };

    let mut status = dataset.status.clone().unwrap_or_default();
    let outcome = run_stages(&ctx, &dataset, &mut status).await;
    lifecycle::finish(&ctx, &dataset, status, outcome).await
}

async fn run_stages(ctx: &Context, dataset: &Dataset, status: &mut ResourceStatus) -> StageOutcome {
    proceed!(lifecycle::validate(dataset));
    proceed!(reconcile_container(ctx, dataset, status).await);
    reconcile_data(ctx, dataset, status).await
}

fn loader_container(dataset: &Dataset, image: String) -> Container {
    let mut env_vars = vec![env(
        "LOAD_DATA_PATH",
        format!("{}/{}", DATA_MOUNT, dataset.spec.filename),
    )];
    env_vars.extend(param_env(&dataset.spec.params));
    Container {
        name: LOADER_CONTAINER.to_string(),
        image: Some(image),
        args: Some(vec!["load.sh".to_string()]),
        env: Some(env_vars),
        ..Default::default()
    }
}

async fn reconcile_data(ctx: &Context, dataset: &Dataset, status: &mut ResourceStatus) -> StageOutcome {
    if status.has_url() {
        status.set_condition(CONDITION_DATA_READY, true, "DataLoaded", "");
        return StageOutcome::Success;
    }

    let namespace = dataset.namespace().unwrap_or_default();
    let uid = try_stage!(resource_uid(dataset));
    let image = try_stage!(resolved_image(dataset, &ctx.config));

    try_stage!(ensure_identity(ctx, &namespace, JobStage::DataLoader.service_account()).await);

    let mounts = vec![
        ctx.cloud.writer_mount("data", &uid, "data", DATA_MOUNT),
        ctx.cloud.writer_mount("logs", &uid, "logs", LOGS_MOUNT),
    ];
    let job = try_stage!(build_job(
        dataset,
        JobStage::DataLoader,
        loader_container(dataset, image),
        mounts,
        ctx.cloud.pod_annotations(),
    ));

    match ensure_job(ctx.kube.as_ref(), &job).await {
        StageOutcome::Success => {}
        StageOutcome::Incomplete => {
            status.set_condition(
                CONDITION_DATA_READY,
                false,
                "JobRunning",
                format!(
                    "waiting for job {}",
                    job_name(&dataset.name_any(), JobStage::DataLoader)
                ),
            );
            return StageOutcome::Incomplete;
        }
        fatal => return fatal,
    }

    let url = ctx
        .cloud
        .artifact_url(&uid, "data", Some(&dataset.spec.filename));
    let checksum = try_stage!(ctx.cloud.get_object_checksum(&url).await);
    info!(url = %url, checksum = %checksum, "dataset loaded");

    status.url = url;
    status.checksum = Some(checksum);
    status.set_condition(CONDITION_DATA_READY, true, "DataLoaded", "");
    StageOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mockall::predicate::eq;

    use kiln_common::conditions::{CONDITION_CONTAINER_READY, CONDITION_FAILED};
    use kiln_common::crd::{Managed, ResourceKind};

    use crate::kube_client::MockKubeClient;
    use crate::testing::{context, dataset, running_job, succeeded_job, MockSci, BUCKET, NAMESPACE};

    const UID: &str = "4f1c";

    fn with_status(mut ds: Dataset, status: ResourceStatus) -> Dataset {
        ds.status = Some(status);
        ds
    }

    fn expect_fetch(kube: &mut MockKubeClient, ds: Dataset) {
        kube.expect_get_resource()
            .with(eq(ResourceKind::Dataset), eq(NAMESPACE), eq("squad"))
            .returning(move |_, _, _| Ok(Some(ds.clone().into_managed())));
    }

    // ==========================================================================
    // Story: a fresh Dataset is loaded, verified and becomes Ready
    // ==========================================================================

    #[tokio::test]
    async fn first_pass_creates_loader_job_and_waits() {
        let ds = dataset("squad", UID);
        let mut kube = MockKubeClient::new();
        expect_fetch(&mut kube, ds.clone());
        kube.expect_apply_service_account()
            .withf(|sa| {
                sa.metadata.name.as_deref() == Some("data-loader")
                    && sa.metadata.annotations.as_ref().is_some_and(|a| {
                        a.get("iam.gke.io/gcp-service-account").map(String::as_str)
                            == Some("kiln-data-loader@acme-ml.iam.gserviceaccount.com")
                    })
            })
            .times(1)
            .returning(|_| Ok(()));
        kube.expect_create_job()
            .withf(|job| {
                let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
                let container = &pod.containers[0];
                let mounts = container.volume_mounts.as_ref().unwrap();
                job.metadata.name.as_deref() == Some("squad-data-loader")
                    && container.args == Some(vec!["load.sh".to_string()])
                    && container.env.as_ref().unwrap()[0].value.as_deref()
                        == Some("/data/train.jsonl")
                    && mounts[0].sub_path.as_deref() == Some("4f1c/data")
                    && mounts[1].mount_path == "/dataset/logs"
                    && mounts[1].sub_path.as_deref() == Some("4f1c/logs")
            })
            .times(1)
            .returning(|_| Ok(()));
        kube.expect_get_job()
            .with(eq(NAMESPACE), eq("squad-data-loader"))
            .returning(|_, _| Ok(Some(running_job())));
        kube.expect_patch_status()
            .withf(|kind, _, name, status| {
                *kind == ResourceKind::Dataset
                    && name == "squad"
                    && !status.ready
                    && status.is_condition_true(CONDITION_CONTAINER_READY)
                    && !status.is_condition_true(CONDITION_DATA_READY)
                    && status.url.is_empty()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut sci = MockSci::new();
        sci.expect_bind_identity()
            .with(
                eq("kiln-data-loader@acme-ml.iam.gserviceaccount.com"),
                eq(NAMESPACE),
                eq("data-loader"),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        sci.expect_get_object_checksum().never();

        let action = reconcile(Arc::new(ds), context(kube, sci)).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn second_pass_records_url_and_checksum() {
        let mut first = ResourceStatus::default();
        first.set_condition(CONDITION_CONTAINER_READY, true, "ImageProvided", "");
        first.set_condition(CONDITION_DATA_READY, false, "JobRunning", "waiting for job squad-data-loader");
        let ds = with_status(dataset("squad", UID), first);

        let mut kube = MockKubeClient::new();
        expect_fetch(&mut kube, ds.clone());
        kube.expect_apply_service_account().returning(|_| Ok(()));
        kube.expect_create_job().returning(|_| {
            Err(Error::Kube {
                source: kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "already exists".to_string(),
                    reason: "AlreadyExists".to_string(),
                    code: 409,
                }),
            })
        });
        kube.expect_get_job().returning(|_, _| Ok(Some(succeeded_job())));
        kube.expect_patch_status()
            .withf(|_, _, _, status| {
                status.ready
                    && status.url == format!("gcs://{}/4f1c/data/train.jsonl", BUCKET)
                    && status.checksum.as_deref() == Some("9e107d9d372bb6826bd81d3542a419d6")
                    && status.observed_generation == Some(1)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut sci = MockSci::new();
        sci.expect_bind_identity().returning(|_, _, _| Ok(()));
        sci.expect_get_object_checksum()
            .with(eq(BUCKET), eq("4f1c/data/train.jsonl"))
            .times(1)
            .returning(|_, _| Ok("9e107d9d372bb6826bd81d3542a419d6".to_string()));

        let action = reconcile(Arc::new(ds), context(kube, sci)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // ==========================================================================
    // Story: a recorded URL is never reloaded
    // ==========================================================================

    #[tokio::test]
    async fn recorded_url_skips_job_and_identity() {
        let mut ready = ResourceStatus {
            url: format!("gcs://{}/{}/data/train.jsonl", BUCKET, UID),
            checksum: Some("9e107d9d372bb6826bd81d3542a419d6".to_string()),
            observed_generation: Some(1),
            ..Default::default()
        };
        ready.set_condition(CONDITION_CONTAINER_READY, true, "ImageProvided", "");
        ready.set_condition(CONDITION_DATA_READY, true, "DataLoaded", "");
        ready.ready = true;
        let ds = with_status(dataset("squad", UID), ready);

        let mut kube = MockKubeClient::new();
        expect_fetch(&mut kube, ds.clone());
        kube.expect_apply_service_account().never();
        kube.expect_create_job().never();
        kube.expect_get_job().never();
        kube.expect_patch_status().never();

        let mut sci = MockSci::new();
        sci.expect_bind_identity().never();
        sci.expect_get_object_checksum().never();

        let action = reconcile(Arc::new(ds), context(kube, sci)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // ==========================================================================
    // Story: errors that retrying cannot fix end up in status, not in a loop
    // ==========================================================================

    #[tokio::test]
    async fn invalid_spec_marks_failed_without_error() {
        let mut ds = dataset("squad", UID);
        ds.spec.filename = "nested/train.jsonl".to_string();

        let mut kube = MockKubeClient::new();
        expect_fetch(&mut kube, ds.clone());
        kube.expect_create_job().never();
        kube.expect_patch_status()
            .withf(|_, _, _, status| {
                let failed = status
                    .conditions
                    .iter()
                    .find(|c| c.type_ == CONDITION_FAILED)
                    .unwrap();
                let container = status
                    .conditions
                    .iter()
                    .find(|c| c.type_ == CONDITION_CONTAINER_READY)
                    .unwrap();
                failed.is_true()
                    && failed.reason == "InvalidSpec"
                    && !container.is_true()
                    && container.reason == "InvalidSpec"
                    && !status.ready
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let action = reconcile(Arc::new(ds), context(kube, MockSci::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn transient_cloud_error_is_returned_for_backoff() {
        let ds = dataset("squad", UID);

        let mut kube = MockKubeClient::new();
        expect_fetch(&mut kube, ds.clone());
        kube.expect_apply_service_account().returning(|_| Ok(()));
        kube.expect_create_job().never();
        kube.expect_patch_status().returning(|_, _, _, _| Ok(()));

        let mut sci = MockSci::new();
        sci.expect_bind_identity()
            .returning(|_, _, _| Err(Error::cloud("gcp", "backend unavailable")));

        let err = reconcile(Arc::new(ds), context(kube, sci)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn deleted_dataset_is_ignored() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_resource().returning(|_, _, _| Ok(None));
        kube.expect_patch_status().never();

        let action = reconcile(Arc::new(dataset("squad", UID)), context(kube, MockSci::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }
}
