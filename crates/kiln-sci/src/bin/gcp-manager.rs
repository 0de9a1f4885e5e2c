//! Kiln GCP manager - cloud-control backend for Google Cloud

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use kiln_common::telemetry::{init_telemetry, TelemetryConfig};
use kiln_common::DEFAULT_SCI_PORT;
use kiln_sci::gcp::RestGcpApi;
use kiln_sci::{GcpBackend, SciServer};

/// Serves kiln.sci.v1.CloudControl against GCP IAM and Cloud Storage
#[derive(Parser, Debug)]
#[command(name = "kiln-gcp-manager", version, about, long_about = None)]
struct Cli {
    /// GCP project hosting the cluster and its workload identity pool
    #[arg(long, env = "GCP_PROJECT_ID")]
    project_id: String,

    /// Address to listen on
    #[arg(long, env = "KILN_SCI_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SCI_PORT)))]
    listen: SocketAddr,

    /// Timeout for calls to Google APIs, in seconds
    #[arg(long, env = "KILN_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    http_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        service_name: "kiln-gcp-manager".to_string(),
        ..Default::default()
    })?;

    let cli = Cli::parse();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cli.http_timeout_secs))
        .build()?;
    let api = RestGcpApi::from_environment(http).await?;
    let backend = GcpBackend::new(cli.project_id, Arc::new(api));

    SciServer::new(Arc::new(backend), cli.listen)
        .run_until(shutdown_signal())
        .await?;

    tracing::info!("kiln-gcp-manager stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
