//! Kiln AWS manager - cloud-control backend for Amazon Web Services

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use kiln_common::telemetry::{init_telemetry, TelemetryConfig};
use kiln_common::DEFAULT_SCI_PORT;
use kiln_sci::aws::{OidcProvider, RestAwsApi};
use kiln_sci::credentials::CredentialSource;
use kiln_sci::{AwsBackend, SciServer};

/// Serves kiln.sci.v1.CloudControl against AWS IAM and S3
#[derive(Parser, Debug)]
#[command(name = "kiln-aws-manager", version, about, long_about = None)]
struct Cli {
    /// AWS account hosting the cluster
    #[arg(long, env = "AWS_ACCOUNT_ID")]
    account_id: String,

    /// Region of the artifact bucket
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Cluster OIDC issuer URL (e.g. https://oidc.eks.us-west-2.amazonaws.com/id/ABC)
    #[arg(long, env = "AWS_OIDC_PROVIDER_URL")]
    oidc_provider_url: String,

    /// IAM OIDC provider ARN; derived from the account and issuer URL if unset
    #[arg(long, env = "AWS_OIDC_PROVIDER_ARN")]
    oidc_provider_arn: Option<String>,

    /// Address to listen on
    #[arg(long, env = "KILN_SCI_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SCI_PORT)))]
    listen: SocketAddr,

    /// Timeout for calls to AWS APIs, in seconds
    #[arg(long, env = "KILN_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    http_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        service_name: "kiln-aws-manager".to_string(),
        ..Default::default()
    })?;

    let cli = Cli::parse();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cli.http_timeout_secs))
        .build()?;
    let credentials = CredentialSource::from_env(http.clone(), &cli.region)?;
    let oidc = OidcProvider::new(&cli.account_id, &cli.oidc_provider_url, cli.oidc_provider_arn);
    tracing::info!(provider = %oidc.arn, region = %cli.region, "configured AWS backend");

    let api = RestAwsApi::new(http, credentials, cli.region);
    let backend = AwsBackend::new(oidc, Arc::new(api));

    SciServer::new(Arc::new(backend), cli.listen)
        .run_until(shutdown_signal())
        .await?;

    tracing::info!("kiln-aws-manager stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
