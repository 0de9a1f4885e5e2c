//! Model reconciler: container → model-train
//!
//! A Model with a training dataset trains (`train.sh`); without one it
//! imports weights (`load.sh`). Inputs are mounted read-only from the
//! referenced resources' artifact URLs, so the stage waits for them to be
//! Ready first.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Container;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use kiln_cloud::ArtifactMount;
use kiln_common::conditions::CONDITION_MODEL_READY;
use kiln_common::crd::{Model, ObjectRef, ResourceKind, ResourceStatus};
use kiln_common::{proceed, try_stage, Error, StageOutcome};

use crate::container::{reconcile_container, resolved_image};
use crate::context::Context;
use crate::identity::ensure_identity;
use crate::job::{build_job, ensure_job, job_name, param_env, resource_uid, JobStage};
use crate::lifecycle::{self, Dependency};

const MODEL_CONTAINER: &str = "model";
const DATA_MOUNT: &str = "/data";
const BASE_MODEL_MOUNT: &str = "/model/base";
const SAVED_MODEL_MOUNT: &str = "/model/saved";
const LOGS_MOUNT: &str = "/model/logs";

/// Reconcile a Model
#[instrument(skip(model, ctx), fields(model = %model.name_any()))]
pub async fn reconcile(model: Arc<Model>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(model) = lifecycle::refetch(&ctx, model.as_ref()).await? else {
        info!("model no longer exists");
        return Ok(Action::await_change());
    };

    let mut status = model.status.clone().unwrap_or_default();
    let outcome = run_stages(&ctx, &model, &mut status).await;
    lifecycle::finish(&ctx, &model, status, outcome).await
}

async fn run_stages(ctx: &Context, model: &Model, status: &mut ResourceStatus) -> StageOutcome {
    proceed!(lifecycle::validate(model));
    proceed!(reconcile_container(ctx, model, status).await);
    reconcile_model(ctx, model, status).await
}

fn model_container(model: &Model, image: String) -> Container {
    let script = if model.spec.is_training() {
        "train.sh"
    } else {
        "load.sh"
    };
    Container {
        name: MODEL_CONTAINER.to_string(),
        image: Some(image),
        args: Some(vec![script.to_string()]),
        env: Some(param_env(&model.spec.params)),
        ..Default::default()
    }
}

/// Read-only mount of a ready input, or the outcome to stop with
async fn input_mount(
    ctx: &Context,
    status: &mut ResourceStatus,
    kind: ResourceKind,
    reference: &ObjectRef,
    namespace: &str,
    volume: &str,
    mount_path: &str,
) -> Result<ArtifactMount, StageOutcome> {
    match lifecycle::dependency(ctx, kind, reference, namespace).await {
        Ok(Dependency::Ready(url)) => ctx
            .cloud
            .mount_for(&url, volume, mount_path)
            .map_err(StageOutcome::Fatal),
        Ok(waiting) => Err(lifecycle::wait_for(
            status,
            CONDITION_MODEL_READY,
            kind,
            reference,
            &waiting,
        )),
        Err(e) => Err(StageOutcome::Fatal(e)),
    }
}

async fn reconcile_model(ctx: &Context, model: &Model, status: &mut ResourceStatus) -> StageOutcome {
    if status.has_url() {
        status.set_condition(CONDITION_MODEL_READY, true, "ModelSaved", "");
        return StageOutcome::Success;
    }

    let namespace = model.namespace().unwrap_or_default();
    let uid = try_stage!(resource_uid(model));
    let image = try_stage!(resolved_image(model, &ctx.config));

    let mut mounts = Vec::new();
    if let Some(reference) = &model.spec.training_dataset {
        let input = input_mount(
            ctx,
            status,
            ResourceKind::Dataset,
            reference,
            &namespace,
            "dataset",
            DATA_MOUNT,
        )
        .await;
        match input {
            Ok(mount) => mounts.push(mount),
            Err(outcome) => return outcome,
        }
    }
    if let Some(reference) = &model.spec.base_model {
        let input = input_mount(
            ctx,
            status,
            ResourceKind::Model,
            reference,
            &namespace,
            "base-model",
            BASE_MODEL_MOUNT,
        )
        .await;
        match input {
            Ok(mount) => mounts.push(mount),
            Err(outcome) => return outcome,
        }
    }

    try_stage!(ensure_identity(ctx, &namespace, JobStage::Modeller.service_account()).await);

    mounts.push(ctx.cloud.writer_mount("saved-model", &uid, "model", SAVED_MODEL_MOUNT));
    mounts.push(ctx.cloud.writer_mount("logs", &uid, "logs", LOGS_MOUNT));

    let job = try_stage!(build_job(
        model,
        JobStage::Modeller,
        model_container(model, image),
        mounts,
        ctx.cloud.pod_annotations(),
    ));

    match ensure_job(ctx.kube.as_ref(), &job).await {
        StageOutcome::Success => {}
        StageOutcome::Incomplete => {
            status.set_condition(
                CONDITION_MODEL_READY,
                false,
                "JobRunning",
                format!(
                    "waiting for job {}",
                    job_name(&model.name_any(), JobStage::Modeller)
                ),
            );
            return StageOutcome::Incomplete;
        }
        fatal => return fatal,
    }

    let url = ctx.cloud.artifact_url(&uid, "model", None);
    info!(url = %url, "model saved");
    status.url = url;
    status.set_condition(CONDITION_MODEL_READY, true, "ModelSaved", "");
    StageOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mockall::predicate::eq;

    use kiln_common::conditions::CONDITION_CONTAINER_READY;
    use kiln_common::crd::Managed;

    use crate::kube_client::MockKubeClient;
    use crate::testing::{
        context, dataset, model, running_job, succeeded_job, MockSci, BUCKET, NAMESPACE,
    };

    fn ready_dataset() -> kiln_common::crd::Dataset {
        let mut ds = dataset("squad", "d-1");
        ds.status = Some(ResourceStatus {
            ready: true,
            url: format!("gcs://{}/d-1/data/train.jsonl", BUCKET),
            ..Default::default()
        });
        ds
    }

    fn expect_model(kube: &mut MockKubeClient, m: Model) {
        kube.expect_get_resource()
            .with(eq(ResourceKind::Model), eq(NAMESPACE), eq("llama"))
            .returning(move |_, _, _| Ok(Some(m.clone().into_managed())));
    }

    // ==========================================================================
    // Story: training waits for its dataset
    // ==========================================================================

    #[tokio::test]
    async fn missing_dataset_keeps_model_waiting() {
        let mut kube = MockKubeClient::new();
        expect_model(&mut kube, model("llama", "m-1", Some("squad")));
        kube.expect_get_resource()
            .with(eq(ResourceKind::Dataset), eq(NAMESPACE), eq("squad"))
            .returning(|_, _, _| Ok(None));
        kube.expect_create_job().never();
        kube.expect_patch_status()
            .withf(|_, _, _, status| {
                let cond = status
                    .conditions
                    .iter()
                    .find(|c| c.type_ == CONDITION_MODEL_READY)
                    .unwrap();
                !cond.is_true()
                    && cond.reason == "WaitingForDataset"
                    && cond.message == "dataset squad is not found"
                    && !status.ready
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let action = reconcile(
            Arc::new(model("llama", "m-1", Some("squad"))),
            context(kube, MockSci::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn unready_dataset_keeps_model_waiting() {
        let mut kube = MockKubeClient::new();
        expect_model(&mut kube, model("llama", "m-1", Some("squad")));
        kube.expect_get_resource()
            .with(eq(ResourceKind::Dataset), eq(NAMESPACE), eq("squad"))
            .returning(|_, _, _| Ok(Some(dataset("squad", "d-1").into_managed())));
        kube.expect_create_job().never();
        kube.expect_patch_status().returning(|_, _, _, _| Ok(()));

        let action = reconcile(
            Arc::new(model("llama", "m-1", Some("squad"))),
            context(kube, MockSci::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn recorded_url_skips_dependencies_job_and_identity() {
        let mut saved = ResourceStatus {
            url: format!("gcs://{}/m-1/model/", BUCKET),
            observed_generation: Some(1),
            ..Default::default()
        };
        saved.set_condition(CONDITION_CONTAINER_READY, true, "ImageProvided", "");
        saved.set_condition(CONDITION_MODEL_READY, true, "ModelSaved", "");
        saved.ready = true;
        let mut m = model("llama", "m-1", Some("squad"));
        m.status = Some(saved);

        let mut kube = MockKubeClient::new();
        expect_model(&mut kube, m.clone());
        kube.expect_get_resource()
            .with(eq(ResourceKind::Dataset), eq(NAMESPACE), eq("squad"))
            .never();
        kube.expect_apply_service_account().never();
        kube.expect_create_job().never();
        kube.expect_get_job().never();
        kube.expect_patch_status().never();

        let mut sci = MockSci::new();
        sci.expect_bind_identity().never();
        sci.expect_get_object_checksum().never();

        let action = reconcile(Arc::new(m), context(kube, sci)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // ==========================================================================
    // Story: a ready dataset is mounted and the trainer runs
    // ==========================================================================

    #[tokio::test]
    async fn ready_dataset_is_mounted_into_training_job() {
        let mut kube = MockKubeClient::new();
        expect_model(&mut kube, model("llama", "m-1", Some("squad")));
        kube.expect_get_resource()
            .with(eq(ResourceKind::Dataset), eq(NAMESPACE), eq("squad"))
            .returning(|_, _, _| Ok(Some(ready_dataset().into_managed())));
        kube.expect_apply_service_account()
            .withf(|sa| sa.metadata.name.as_deref() == Some("modeller"))
            .returning(|_| Ok(()));
        kube.expect_create_job()
            .withf(|job| {
                let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
                let container = &pod.containers[0];
                let mounts = container.volume_mounts.as_ref().unwrap();
                let data = mounts.iter().find(|m| m.mount_path == "/data").unwrap();
                let saved = mounts.iter().find(|m| m.mount_path == "/model/saved").unwrap();
                job.metadata.name.as_deref() == Some("llama-modeller")
                    && container.args == Some(vec!["train.sh".to_string()])
                    && data.read_only == Some(true)
                    && data.sub_path.as_deref() == Some("d-1/data")
                    && saved.sub_path.as_deref() == Some("m-1/model")
                    && pod.service_account_name.as_deref() == Some("modeller")
            })
            .times(1)
            .returning(|_| Ok(()));
        kube.expect_get_job().returning(|_, _| Ok(Some(running_job())));
        kube.expect_patch_status()
            .withf(|_, _, _, status| {
                status.is_condition_true(CONDITION_CONTAINER_READY)
                    && !status.is_condition_true(CONDITION_MODEL_READY)
            })
            .returning(|_, _, _, _| Ok(()));

        let mut sci = MockSci::new();
        sci.expect_bind_identity()
            .with(
                eq("kiln-modeller@acme-ml.iam.gserviceaccount.com"),
                eq(NAMESPACE),
                eq("modeller"),
            )
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(model("llama", "m-1", Some("squad"))), context(kube, sci))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finished_import_records_directory_url() {
        let mut kube = MockKubeClient::new();
        expect_model(&mut kube, model("llama", "m-1", None));
        kube.expect_apply_service_account().returning(|_| Ok(()));
        kube.expect_create_job()
            .withf(|job| {
                let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
                pod.containers[0].args == Some(vec!["load.sh".to_string()])
            })
            .returning(|_| Ok(()));
        kube.expect_get_job().returning(|_, _| Ok(Some(succeeded_job())));
        kube.expect_patch_status()
            .withf(|_, _, _, status| {
                status.ready
                    && status.url == format!("gcs://{}/m-1/model/", BUCKET)
                    && status.checksum.is_none()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut sci = MockSci::new();
        sci.expect_bind_identity().returning(|_, _, _| Ok(()));
        sci.expect_get_object_checksum().never();

        let action = reconcile(Arc::new(model("llama", "m-1", None)), context(kube, sci))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn foreign_scheme_dataset_url_is_permanent() {
        let mut foreign = ready_dataset();
        if let Some(status) = foreign.status.as_mut() {
            status.url = "s3://other-bucket/d-1/data/train.jsonl".to_string();
        }

        let mut kube = MockKubeClient::new();
        expect_model(&mut kube, model("llama", "m-1", Some("squad")));
        kube.expect_get_resource()
            .with(eq(ResourceKind::Dataset), eq(NAMESPACE), eq("squad"))
            .returning(move |_, _, _| Ok(Some(foreign.clone().into_managed())));
        kube.expect_create_job().never();
        kube.expect_patch_status()
            .withf(|_, _, _, status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.type_ == "Failed" && c.is_true() && c.reason == "MalformedURL")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let action = reconcile(
            Arc::new(model("llama", "m-1", Some("squad"))),
            context(kube, MockSci::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }
}
