//! Cloud strategy registry

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use kiln_common::{Error, Result};

use crate::aws::AwsCloud;
use crate::client::SciClient;
use crate::cloud::{Cloud, CloudName};
use crate::config::CloudConfig;
use crate::gcp::GcpCloud;

/// Strategy table keyed by cloud name
#[derive(Clone, Default)]
pub struct CloudRegistry {
    clouds: HashMap<CloudName, Arc<dyn Cloud>>,
}

impl CloudRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the strategy for its cloud
    pub fn register(&mut self, cloud: Arc<dyn Cloud>) {
        self.clouds.insert(cloud.name(), cloud);
    }

    /// Strategy for `name`
    pub fn get(&self, name: CloudName) -> Result<Arc<dyn Cloud>> {
        self.clouds
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::validation(format!("cloud {} is not configured", name)))
    }

    /// Build a registry holding the configured cloud
    pub fn from_config(config: &CloudConfig, sci: Arc<dyn SciClient>) -> Result<Self> {
        let bucket = config.artifact_bucket.clone();
        let cloud: Arc<dyn Cloud> = match config.cloud {
            CloudName::Gcp => {
                let project = required(&config.gcp_project_id, "GCP_PROJECT_ID")?;
                Arc::new(GcpCloud::new(project, bucket, sci))
            }
            CloudName::Aws => {
                let account = required(&config.aws_account_id, "AWS_ACCOUNT_ID")?;
                Arc::new(AwsCloud::new(account, bucket, sci))
            }
        };

        info!(
            cloud = %cloud.name(),
            bucket = cloud.artifact_bucket(),
            "registered cloud strategy"
        );
        let mut registry = Self::new();
        registry.register(cloud);
        Ok(registry)
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::validation(format!("{} is required for this cloud", name)))
}
