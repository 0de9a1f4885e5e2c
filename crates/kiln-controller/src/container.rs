//! Container stage, shared by every kind
//!
//! A prebuilt image is ready immediately. A git source is built by a kaniko
//! Job that pushes `<registry>/<kind>-<namespace>-<name>:latest`, and later
//! stages run that tag.

use k8s_openapi::api::core::v1::Container;
use kube::ResourceExt;
use tracing::info;

use kiln_common::conditions::CONDITION_CONTAINER_READY;
use kiln_common::crd::{GitSource, Managed, ResourceStatus};
use kiln_common::{try_stage, Error, StageOutcome};

use crate::context::{ControllerConfig, Context};
use crate::identity::ensure_identity;
use crate::job::{build_job, ensure_job, job_name, JobStage};

const BUILDER_CONTAINER: &str = "builder";
const DEFAULT_BRANCH: &str = "main";

/// Image later stages run for `resource`
///
/// For git sources this is the tag the builder Job pushes; a git source with
/// no registry configured is a permanent error.
pub fn resolved_image<K: Managed>(resource: &K, config: &ControllerConfig) -> Result<String, Error> {
    let container = resource.container();
    if let Some(image) = &container.image {
        return Ok(image.clone());
    }
    if container.git.is_none() {
        return Err(Error::validation_for_field(
            resource.name_any(),
            "spec.container",
            "container requires either image or git",
        ));
    }
    let registry = config.image_registry.as_deref().ok_or_else(|| {
        Error::validation_for_field(
            resource.name_any(),
            "spec.container.git",
            "building from git needs an image registry (KILN_IMAGE_REGISTRY)",
        )
    })?;
    Ok(format!(
        "{}/{}-{}-{}:latest",
        registry.trim_end_matches('/'),
        K::KIND.lowercase(),
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    ))
}

/// kaniko `--context` for a git source
pub fn git_context(git: &GitSource) -> String {
    let repo = git
        .url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("git://");
    format!(
        "git://{}#refs/heads/{}",
        repo,
        git.branch.as_deref().unwrap_or(DEFAULT_BRANCH)
    )
}

fn builder_container(git: &GitSource, destination: &str, config: &ControllerConfig) -> Container {
    let mut args = vec![
        format!("--context={}", git_context(git)),
        format!("--destination={}", destination),
    ];
    if let Some(path) = git.path.as_deref().filter(|p| !p.is_empty()) {
        args.push(format!("--context-sub-path={}", path));
    }
    Container {
        name: BUILDER_CONTAINER.to_string(),
        image: Some(config.builder_image.clone()),
        args: Some(args),
        ..Default::default()
    }
}

/// Make sure the resource's container image exists
pub async fn reconcile_container<K: Managed>(
    ctx: &Context,
    resource: &K,
    status: &mut ResourceStatus,
) -> StageOutcome {
    let container = resource.container();
    if container.image.is_some() {
        status.set_condition(CONDITION_CONTAINER_READY, true, "ImageProvided", "");
        return StageOutcome::Success;
    }
    let Some(git) = container.git.as_ref() else {
        return StageOutcome::Fatal(Error::validation_for_field(
            resource.name_any(),
            "spec.container",
            "container requires either image or git",
        ));
    };
    if status.is_condition_true(CONDITION_CONTAINER_READY) {
        return StageOutcome::Success;
    }

    let destination = try_stage!(resolved_image(resource, &ctx.config));
    let namespace = resource.namespace().unwrap_or_default();
    try_stage!(
        ensure_identity(ctx, &namespace, JobStage::ContainerBuilder.service_account()).await
    );

    let job = try_stage!(build_job(
        resource,
        JobStage::ContainerBuilder,
        builder_container(git, &destination, &ctx.config),
        vec![],
        Default::default(),
    ));

    match ensure_job(ctx.kube.as_ref(), &job).await {
        StageOutcome::Success => {
            info!(image = %destination, "container image built");
            status.set_condition(CONDITION_CONTAINER_READY, true, "ImageBuilt", destination);
            StageOutcome::Success
        }
        StageOutcome::Incomplete => {
            status.set_condition(
                CONDITION_CONTAINER_READY,
                false,
                "JobRunning",
                format!(
                    "waiting for job {}",
                    job_name(&resource.name_any(), JobStage::ContainerBuilder)
                ),
            );
            StageOutcome::Incomplete
        }
        fatal => fatal,
    }
}
