//! Server reconciler: container → server-deploy
//!
//! Serves a Ready Model from a Deployment that mounts the model artifact
//! read-only at `/model/saved`, behind a ClusterIP Service. Both objects are
//! server-side applied on every pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, instrument};

use kiln_cloud::{split_mounts, ArtifactMount};
use kiln_common::conditions::CONDITION_SERVER_READY;
use kiln_common::crd::{ResourceKind, ResourceStatus, Server, SERVER_PORT};
use kiln_common::{proceed, try_stage, Error, StageOutcome};

use crate::container::{reconcile_container, resolved_image};
use crate::context::Context;
use crate::identity::{ensure_identity, MODEL_SERVER_SERVICE_ACCOUNT};
use crate::job::{
    container_security_context, labels, owner_reference, param_env, pod_security_context,
    resource_requirements, DEFAULT_CONTAINER_ANNOTATION,
};
use crate::lifecycle::{self, Dependency};

const SERVER_CONTAINER: &str = "server";
const SAVED_MODEL_MOUNT: &str = "/model/saved";

/// Name of the Deployment and Service for a Server
pub fn server_object_name(server: &Server) -> String {
    format!("{}-server", server.name_any())
}

fn selector(server: &Server) -> BTreeMap<String, String> {
    BTreeMap::from([("kiln.dev/server".to_string(), server.name_any())])
}

/// Reconcile a Server
#[instrument(skip(server, ctx), fields(server = %server.name_any()))]
pub async fn reconcile(server: Arc<Server>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(server) = lifecycle::refetch(&ctx, server.as_ref()).await? else {
        info!("server no longer exists");
        return Ok(Action::await_change());
    };

    let mut status = server.status.clone().unwrap_or_default();
    let outcome = run_stages(&ctx, &server, &mut status).await;
    lifecycle::finish(&ctx, &server, status, outcome).await
}

async fn run_stages(ctx: &Context, server: &Server, status: &mut ResourceStatus) -> StageOutcome {
    proceed!(lifecycle::validate(server));
    proceed!(reconcile_container(ctx, server, status).await);
    reconcile_deployment(ctx, server, status).await
}

/// Deployment serving `server` with `model` mounted
pub fn build_deployment(
    server: &Server,
    image: String,
    model: ArtifactMount,
    pod_annotations: BTreeMap<String, String>,
) -> Result<Deployment, Error> {
    let owner = owner_reference(server)?;
    let selector = selector(server);
    let mut pod_labels = labels(server);
    pod_labels.extend(selector.clone());

    let mut annotations = pod_annotations;
    annotations.insert(
        DEFAULT_CONTAINER_ANNOTATION.to_string(),
        SERVER_CONTAINER.to_string(),
    );

    let (volumes, volume_mounts) = split_mounts(vec![model]);
    let container = Container {
        name: SERVER_CONTAINER.to_string(),
        image: Some(image),
        args: Some(vec!["serve.sh".to_string()]),
        env: Some(param_env(&server.spec.params)),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: SERVER_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        resources: Some(resource_requirements(server.spec.resources.as_ref())),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(server_object_name(server)),
            namespace: server.namespace(),
            labels: Some(labels(server)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    service_account_name: Some(MODEL_SERVER_SERVICE_ACCOUNT.to_string()),
                    security_context: Some(pod_security_context()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// ClusterIP Service in front of the Server's Deployment
pub fn build_service(server: &Server) -> Result<Service, Error> {
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(server_object_name(server)),
            namespace: server.namespace(),
            labels: Some(labels(server)),
            owner_references: Some(vec![owner_reference(server)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector(server)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVER_PORT,
                target_port: Some(IntOrString::String("http".to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

async fn reconcile_deployment(
    ctx: &Context,
    server: &Server,
    status: &mut ResourceStatus,
) -> StageOutcome {
    let namespace = server.namespace().unwrap_or_default();
    let image = try_stage!(resolved_image(server, &ctx.config));

    let reference = &server.spec.model;
    let model_url = match try_stage!(
        lifecycle::dependency(ctx, ResourceKind::Model, reference, &namespace).await
    ) {
        Dependency::Ready(url) => url,
        waiting => {
            return lifecycle::wait_for(
                status,
                CONDITION_SERVER_READY,
                ResourceKind::Model,
                reference,
                &waiting,
            )
        }
    };
    let model = try_stage!(ctx.cloud.mount_for(&model_url, "saved-model", SAVED_MODEL_MOUNT));

    try_stage!(ensure_identity(ctx, &namespace, MODEL_SERVER_SERVICE_ACCOUNT).await);

    let deployment = try_stage!(build_deployment(
        server,
        image,
        model,
        ctx.cloud.pod_annotations()
    ));
    let service = try_stage!(build_service(server));
    try_stage!(ctx.kube.apply_deployment(&deployment).await);
    try_stage!(ctx.kube.apply_service(&service).await);

    let name = server_object_name(server);
    let live = try_stage!(ctx.kube.get_deployment(&namespace, &name).await);
    if live.as_ref().map(ready_replicas).unwrap_or(0) >= 1 {
        status.set_condition(CONDITION_SERVER_READY, true, "DeploymentReady", "");
        return StageOutcome::Success;
    }

    status.set_condition(
        CONDITION_SERVER_READY,
        false,
        "DeploymentNotReady",
        format!("waiting for deployment {}", name),
    );
    StageOutcome::Incomplete
}
