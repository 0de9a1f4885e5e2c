use crate::cloud::CloudName;

/// Which cloud the controller runs against and how it is addressed
#[derive(Clone, Debug)]
pub struct CloudConfig {
    /// Selected cloud
    pub cloud: CloudName,
    /// GCP project (required for GCP)
    pub gcp_project_id: Option<String>,
    /// AWS account id (required for AWS)
    pub aws_account_id: Option<String>,
    /// Override for the artifact bucket name
    pub artifact_bucket: Option<String>,
}
