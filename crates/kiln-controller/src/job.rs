//! Job orchestration
//!
//! Every stage that does real work runs it in a Kubernetes Job named
//! `<resource>-<stage-suffix>` and owned by the resource, so deleting the
//! resource cascades to its Jobs. [`ensure_job`] is safe to call on every
//! reconcile: creating a Job that already exists is not an error, and the
//! outcome is read back from the live Job.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use kiln_cloud::{split_mounts, ArtifactMount};
use kiln_common::crd::{ComputeResources, Managed, Params};
use kiln_common::{try_stage, Error, StageOutcome};

use crate::kube_client::KubeClient;

/// Pod annotation naming the container `kubectl logs` and `exec` default to
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

/// Label marking objects created by the controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "kiln";

/// Label carrying the stage a Job runs
pub const STAGE_LABEL: &str = "kiln.dev/stage";

/// Resource name for GPU requests
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

const RUN_AS_USER: i64 = 1001;
const RUN_AS_GROUP: i64 = 2002;
const FS_GROUP: i64 = 3003;
const BACKOFF_LIMIT: i32 = 3;

/// Stages that run as a Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStage {
    /// Builds and pushes the resource's container image
    ContainerBuilder,
    /// Loads a Dataset's data into the artifact bucket
    DataLoader,
    /// Trains or imports a Model
    Modeller,
}

impl JobStage {
    /// Suffix appended to the resource name to form the Job name
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::ContainerBuilder => "container-builder",
            Self::DataLoader => "data-loader",
            Self::Modeller => "modeller",
        }
    }

    /// Generated service account the stage's pods run as
    pub fn service_account(&self) -> &'static str {
        self.suffix()
    }
}

/// Name of the Job running `stage` for the resource called `resource_name`
pub fn job_name(resource_name: &str, stage: JobStage) -> String {
    format!("{}-{}", resource_name, stage.suffix())
}

/// Controller owner reference pointing at `resource`
///
/// A resource without a uid has not been persisted yet; nothing it owns can
/// be created, and retrying will not change that.
pub fn owner_reference<K: Managed>(resource: &K) -> Result<OwnerReference, Error> {
    resource.controller_owner_ref(&()).ok_or_else(|| {
        Error::validation_for(
            resource.name_any(),
            format!("{} has no uid; cannot own child objects", K::KIND),
        )
    })
}

/// Uid of `resource`, which prefixes every artifact it writes
pub fn resource_uid<K: Managed>(resource: &K) -> Result<String, Error> {
    resource.uid().ok_or_else(|| {
        Error::validation_for(
            resource.name_any(),
            format!("{} has no uid; cannot place artifacts", K::KIND),
        )
    })
}

/// Pod security context shared by every stage
pub fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_user: Some(RUN_AS_USER),
        run_as_group: Some(RUN_AS_GROUP),
        fs_group: Some(FS_GROUP),
        run_as_non_root: Some(true),
        ..Default::default()
    }
}

/// Container security context shared by every stage
pub fn container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        ..Default::default()
    }
}

/// Requests and limits for a stage container; unset resources get the defaults
pub fn resource_requirements(resources: Option<&ComputeResources>) -> ResourceRequirements {
    let defaults = ComputeResources::default();
    let resources = resources.unwrap_or(&defaults);

    let mut quantities = BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu.to_string())),
        ("memory".to_string(), Quantity(format!("{}Gi", resources.memory))),
        (
            "ephemeral-storage".to_string(),
            Quantity(format!("{}Gi", resources.disk)),
        ),
    ]);
    if let Some(gpu) = resources.gpu.as_ref().filter(|g| g.count > 0) {
        quantities.insert(GPU_RESOURCE.to_string(), Quantity(gpu.count.to_string()));
    }

    ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    }
}

/// `PARAM_<UPPERCASE_KEY>` environment variables for stage parameters
pub fn param_env(params: &Params) -> Vec<EnvVar> {
    params
        .iter()
        .map(|(key, value)| EnvVar {
            name: format!("PARAM_{}", key.to_uppercase()),
            value: Some(value.to_string()),
            ..Default::default()
        })
        .collect()
}

/// Plain `name=value` environment variable
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Labels put on every object created for `resource`
pub fn labels<K: Managed>(resource: &K) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (
            format!("kiln.dev/{}", K::KIND.lowercase()),
            resource.name_any(),
        ),
    ])
}

/// Build the Job running `stage` for `resource`
///
/// `container` supplies name, image, args and env; mounts, resources and the
/// security context are filled in here so every stage gets the same shape.
pub fn build_job<K: Managed>(
    resource: &K,
    stage: JobStage,
    mut container: Container,
    mounts: Vec<ArtifactMount>,
    pod_annotations: BTreeMap<String, String>,
) -> Result<Job, Error> {
    let owner = owner_reference(resource)?;
    let namespace = resource.namespace().ok_or_else(|| {
        Error::validation_for(resource.name_any(), format!("{} must be namespaced", K::KIND))
    })?;

    let mut labels = labels(resource);
    labels.insert(STAGE_LABEL.to_string(), stage.suffix().to_string());

    let mut annotations = pod_annotations;
    annotations.insert(
        DEFAULT_CONTAINER_ANNOTATION.to_string(),
        container.name.clone(),
    );

    let (volumes, volume_mounts) = split_mounts(mounts);
    if !volume_mounts.is_empty() {
        container.volume_mounts = Some(volume_mounts);
    }
    container.resources = Some(resource_requirements(resource.resources()));
    // Image builds unpack layers as root
    let pod_security = (stage != JobStage::ContainerBuilder).then(|| {
        container.security_context = Some(container_security_context());
        pod_security_context()
    });

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name(&resource.name_any(), stage)),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(stage.service_account().to_string()),
                    security_context: pod_security,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// True once at least one pod of the Job has succeeded
pub fn is_job_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|n| n >= 1)
}

/// Check if a Job has failed
pub fn is_job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Failed" && c.status == "True")
        })
}

/// Extract failure message from a failed Job
pub fn job_failure_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Failed" && c.status == "True")
                .and_then(|c| c.message.clone().or_else(|| c.reason.clone()))
        })
}

/// Make sure `job` exists and report whether it has succeeded
///
/// - created, or already there: read it back
/// - `status.succeeded >= 1`: `Success`
/// - not yet succeeded (including a Job that has given up): `Incomplete`
/// - any other API error: `Fatal`
pub async fn ensure_job(kube: &dyn KubeClient, job: &Job) -> StageOutcome {
    let name = job.name_any();
    let Some(namespace) = job.namespace() else {
        return StageOutcome::Fatal(Error::internal_with_context(
            "job",
            format!("job {} has no namespace", name),
        ));
    };

    match kube.create_job(job).await {
        Ok(()) => info!(job = %name, namespace = %namespace, "created job"),
        Err(e) if e.is_already_exists() => debug!(job = %name, "job already exists"),
        Err(e) => return StageOutcome::Fatal(e),
    }

    let Some(current) = try_stage!(kube.get_job(&namespace, &name).await) else {
        debug!(job = %name, "job not visible yet");
        return StageOutcome::Incomplete;
    };

    if is_job_succeeded(&current) {
        return StageOutcome::Success;
    }

    if is_job_failed(&current) {
        warn!(
            job = %name,
            namespace = %namespace,
            failure = %job_failure_message(&current).unwrap_or_default(),
            "job failed; delete it to retry"
        );
    }
    StageOutcome::Incomplete
}
