//! AWS strategy: EKS IAM roles for service accounts and S3 via the
//! mountpoint-s3 CSI driver

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{CSIVolumeSource, Volume};

use crate::client::SciClient;
use crate::cloud::{Cloud, CloudName};

const MOUNTPOINT_DRIVER: &str = "s3.csi.aws.com";
const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

const READER_MOUNT_OPTIONS: &str = "allow-other,uid=0,gid=3003,read-only";
const WRITER_MOUNT_OPTIONS: &str = "allow-other,uid=1001,gid=3003,allow-delete";

/// AWS strategy
pub struct AwsCloud {
    account_id: String,
    bucket: String,
    sci: Arc<dyn SciClient>,
}

impl AwsCloud {
    /// Create the strategy for `account_id`. The bucket defaults to
    /// `<account>-kiln-artifacts`.
    pub fn new(account_id: impl Into<String>, bucket: Option<String>, sci: Arc<dyn SciClient>) -> Self {
        let account_id = account_id.into();
        let bucket = bucket.unwrap_or_else(|| format!("{}-kiln-artifacts", account_id));
        Self {
            account_id,
            bucket,
            sci,
        }
    }
}

impl Cloud for AwsCloud {
    fn name(&self) -> CloudName {
        CloudName::Aws
    }

    fn url_scheme(&self) -> &'static str {
        "s3"
    }

    fn artifact_bucket(&self) -> &str {
        &self.bucket
    }

    fn principal_for(&self, service_account: &str) -> String {
        format!("arn:aws:iam::{}:role/kiln-{}", self.account_id, service_account)
    }

    fn identity_annotations(&self, service_account: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(
            ROLE_ARN_ANNOTATION.to_string(),
            self.principal_for(service_account),
        )])
    }

    fn volume_for(&self, name: &str, bucket: &str, read_only: bool) -> Volume {
        let mount_options = if read_only {
            READER_MOUNT_OPTIONS
        } else {
            WRITER_MOUNT_OPTIONS
        };
        Volume {
            name: name.to_string(),
            csi: Some(CSIVolumeSource {
                driver: MOUNTPOINT_DRIVER.to_string(),
                read_only: Some(read_only),
                volume_attributes: Some(BTreeMap::from([
                    ("bucketName".to_string(), bucket.to_string()),
                    ("mountOptions".to_string(), mount_options.to_string()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn sci(&self) -> &dyn SciClient {
        self.sci.as_ref()
    }
}
