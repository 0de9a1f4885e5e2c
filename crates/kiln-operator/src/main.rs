//! Kiln Operator - ML pipeline control plane for Kubernetes

mod controller_runner;

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use kiln_cloud::{CloudConfig, CloudName, CloudRegistry, GrpcSciClient};
use kiln_common::crd::{Dataset, Model, Server};
use kiln_common::telemetry::{init_telemetry, TelemetryConfig};
use kiln_common::{DEFAULT_SCI_PORT, FIELD_MANAGER, KILN_SYSTEM_NAMESPACE};
use kiln_controller::context::{DEFAULT_BUILDER_IMAGE, DEFAULT_INCOMPLETE_REQUEUE};
use kiln_controller::{Context, ControllerConfig};

/// Kiln - declarative data, training and serving pipelines on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    operator: OperatorArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Dataset, Model and Server controllers (default mode)
    Controller,
}

#[derive(Args, Debug)]
struct OperatorArgs {
    /// Cloud the cluster runs on (gcp, aws)
    #[arg(long, env = "KILN_CLOUD")]
    cloud: Option<CloudName>,

    /// GCP project (required on gcp)
    #[arg(long, env = "GCP_PROJECT_ID")]
    gcp_project_id: Option<String>,

    /// AWS account id (required on aws)
    #[arg(long, env = "AWS_ACCOUNT_ID")]
    aws_account_id: Option<String>,

    /// Artifact bucket; defaults to `<project-or-account>-kiln-artifacts`
    #[arg(long, env = "KILN_ARTIFACT_BUCKET")]
    artifact_bucket: Option<String>,

    /// Address of the cloud-control backend
    #[arg(long, env = "KILN_SCI_ADDRESS", default_value_t = default_sci_address())]
    sci_address: String,

    /// Timeout for cloud-control calls, in seconds
    #[arg(long, env = "KILN_SCI_TIMEOUT_SECS", default_value_t = 30)]
    sci_timeout_secs: u64,

    /// Registry images built from git are pushed to
    #[arg(long, env = "KILN_IMAGE_REGISTRY")]
    image_registry: Option<String>,

    /// Image used for git builds
    #[arg(long, env = "KILN_BUILDER_IMAGE", default_value = DEFAULT_BUILDER_IMAGE)]
    builder_image: String,

    /// Delay before re-checking a resource whose stage is still running, in seconds
    #[arg(long, env = "KILN_INCOMPLETE_REQUEUE_SECS", default_value_t = DEFAULT_INCOMPLETE_REQUEUE.as_secs())]
    incomplete_requeue_secs: u64,
}

fn default_sci_address() -> String {
    format!(
        "http://kiln-sci.{}.svc:{}",
        KILN_SYSTEM_NAMESPACE, DEFAULT_SCI_PORT
    )
}

impl OperatorArgs {
    fn cloud_config(&self) -> anyhow::Result<CloudConfig> {
        let cloud = self
            .cloud
            .ok_or_else(|| anyhow::anyhow!("--cloud (KILN_CLOUD) is required"))?;
        Ok(CloudConfig {
            cloud,
            gcp_project_id: self.gcp_project_id.clone(),
            aws_account_id: self.aws_account_id.clone(),
            artifact_bucket: self.artifact_bucket.clone(),
        })
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            image_registry: self.image_registry.clone(),
            builder_image: self.builder_image.clone(),
            incomplete_requeue: Duration::from_secs(self.incomplete_requeue_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [Dataset::crd(), Model::crd(), Server::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "kiln-operator".to_string(),
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.operator).await,
    }
}

/// Ensure all Kiln CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Dataset::crd(), Model::crd(), Server::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Kiln CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: OperatorArgs) -> anyhow::Result<()> {
    let cloud_config = args.cloud_config()?;
    tracing::info!(cloud = %cloud_config.cloud, sci = %args.sci_address, "Starting Kiln operator");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let sci = GrpcSciClient::connect_lazy(
        cloud_config.cloud,
        &args.sci_address,
        Duration::from_secs(args.sci_timeout_secs),
    )?;
    let registry = CloudRegistry::from_config(&cloud_config, Arc::new(sci))?;
    let cloud = registry.get(cloud_config.cloud)?;

    let ctx = Arc::new(
        Context::builder(client.clone(), cloud)
            .config(args.controller_config())
            .build(),
    );

    tracing::info!("Starting controllers:");
    let controllers = controller_runner::build_controllers(client, ctx);
    futures::future::join_all(controllers).await;

    tracing::info!("Kiln operator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_point_at_in_cluster_backend() {
        let cli = Cli::try_parse_from(["kiln", "--cloud", "gcp", "controller"]).unwrap();
        assert_eq!(cli.operator.sci_address, "http://kiln-sci.kiln-system.svc:10443");
        assert_eq!(cli.operator.builder_image, DEFAULT_BUILDER_IMAGE);
        assert_eq!(cli.operator.incomplete_requeue_secs, 30);
        assert!(matches!(cli.command, Some(Commands::Controller)));
    }

    #[test]
    fn cloud_is_required_to_run() {
        let cli = Cli::try_parse_from(["kiln"]).unwrap();
        assert!(cli.operator.cloud_config().is_err());
    }

    #[test]
    fn unknown_cloud_is_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["kiln", "--cloud", "azure"]).is_err());
    }

    #[test]
    fn flags_flow_into_configs() {
        let cli = Cli::try_parse_from([
            "kiln",
            "--cloud",
            "aws",
            "--aws-account-id",
            "123456789012",
            "--image-registry",
            "123456789012.dkr.ecr.us-west-2.amazonaws.com/kiln",
            "--incomplete-requeue-secs",
            "5",
        ])
        .unwrap();

        let cloud = cli.operator.cloud_config().unwrap();
        assert_eq!(cloud.cloud, CloudName::Aws);
        assert_eq!(cloud.aws_account_id.as_deref(), Some("123456789012"));

        let controller = cli.operator.controller_config();
        assert_eq!(controller.incomplete_requeue, Duration::from_secs(5));
        assert!(controller.image_registry.is_some());
    }
}
