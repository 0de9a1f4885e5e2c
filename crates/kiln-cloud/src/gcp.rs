//! Google Cloud strategy: GKE workload identity and Cloud Storage via the
//! gcsfuse CSI driver

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{CSIVolumeSource, Volume};

use crate::client::SciClient;
use crate::cloud::{Cloud, CloudName};

const GCSFUSE_DRIVER: &str = "gcsfuse.csi.storage.gke.io";
const GCP_SA_ANNOTATION: &str = "iam.gke.io/gcp-service-account";
const GCSFUSE_POD_ANNOTATION: &str = "gke-gcsfuse/volumes";

// gid 3003 is the pod fsGroup; writers own files as uid 1001.
const READER_MOUNT_OPTIONS: &str = "implicit-dirs,uid=0,gid=3003";
const WRITER_MOUNT_OPTIONS: &str = "implicit-dirs,uid=1001,gid=3003";

/// GCP strategy
pub struct GcpCloud {
    project_id: String,
    bucket: String,
    sci: Arc<dyn SciClient>,
}

impl GcpCloud {
    /// Create the strategy for `project_id`. The bucket defaults to
    /// `<project>-kiln-artifacts`.
    pub fn new(project_id: impl Into<String>, bucket: Option<String>, sci: Arc<dyn SciClient>) -> Self {
        let project_id = project_id.into();
        let bucket = bucket.unwrap_or_else(|| format!("{}-kiln-artifacts", project_id));
        Self {
            project_id,
            bucket,
            sci,
        }
    }

    /// GCP project
    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Cloud for GcpCloud {
    fn name(&self) -> CloudName {
        CloudName::Gcp
    }

    fn url_scheme(&self) -> &'static str {
        "gcs"
    }

    fn artifact_bucket(&self) -> &str {
        &self.bucket
    }

    fn principal_for(&self, service_account: &str) -> String {
        format!(
            "kiln-{}@{}.iam.gserviceaccount.com",
            service_account, self.project_id
        )
    }

    fn identity_annotations(&self, service_account: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(
            GCP_SA_ANNOTATION.to_string(),
            self.principal_for(service_account),
        )])
    }

    fn pod_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(GCSFUSE_POD_ANNOTATION.to_string(), "true".to_string())])
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
                driver: GCSFUSE_DRIVER.to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockSciClient;
    use mockall::predicate::eq;

    fn cloud(sci: MockSciClient) -> GcpCloud {
        GcpCloud::new("acme-ml", None, Arc::new(sci))
    }

    #[test]
    fn principal_and_annotation_follow_project() {
        let gcp = cloud(MockSciClient::new());
        assert_eq!(gcp.artifact_bucket(), "acme-ml-kiln-artifacts");
        assert_eq!(
            gcp.principal_for("data-loader"),
            "kiln-data-loader@acme-ml.iam.gserviceaccount.com"
        );
        assert_eq!(
            gcp.identity_annotations("data-loader")[GCP_SA_ANNOTATION],
            "kiln-data-loader@acme-ml.iam.gserviceaccount.com"
        );
        assert_eq!(gcp.pod_annotations()[GCSFUSE_POD_ANNOTATION], "true");
    }

    #[test]
    fn reader_mount_uses_url_bucket_and_subpath() {
        let gcp = cloud(MockSciClient::new());
        let mount = gcp
            .mount_for("gcs://other-bucket/uid-1/data/train.jsonl", "dataset", "/data")
            .unwrap();

        assert_eq!(mount.mount.mount_path, "/data");
        assert_eq!(mount.mount.sub_path.as_deref(), Some("uid-1/data"));
        assert_eq!(mount.mount.read_only, Some(true));

        let csi = mount.volume.csi.unwrap();
        assert_eq!(csi.driver, GCSFUSE_DRIVER);
        assert_eq!(csi.read_only, Some(true));
        let attrs = csi.volume_attributes.unwrap();
        assert_eq!(attrs["bucketName"], "other-bucket");
        assert_eq!(attrs["mountOptions"], READER_MOUNT_OPTIONS);
    }

    #[test]
    fn reader_mount_rejects_foreign_scheme() {
        let gcp = cloud(MockSciClient::new());
        let err = gcp.mount_for("s3://b/uid/data/x", "dataset", "/data").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn writer_mount_targets_artifact_bucket() {
        let gcp = GcpCloud::new("acme-ml", Some("custom".to_string()), Arc::new(MockSciClient::new()));
        let mount = gcp.writer_mount("model", "uid-2", "model", "/model/saved");

        assert_eq!(mount.mount.sub_path.as_deref(), Some("uid-2/model"));
        assert_eq!(mount.mount.read_only, None);
        let csi = mount.volume.csi.unwrap();
        assert_eq!(csi.read_only, Some(false));
        assert_eq!(csi.volume_attributes.unwrap()["bucketName"], "custom");
        assert_eq!(
            gcp.artifact_url("uid-2", "model", None),
            "gcs://custom/uid-2/model/"
        );
    }

    #[tokio::test]
    async fn bind_identity_sends_derived_principal() {
        let mut sci = MockSciClient::new();
        sci.expect_bind_identity()
            .with(
                eq("kiln-modeller@acme-ml.iam.gserviceaccount.com"),
                eq("ml"),
                eq("modeller"),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));

        cloud(sci).bind_identity("ml", "modeller").await.unwrap();
    }

    #[tokio::test]
    async fn checksum_uses_the_unescaped_object_name() {
        let mut sci = MockSciClient::new();
        sci.expect_get_object_checksum()
            .with(eq("acme-ml-kiln-artifacts"), eq("uid-1/data/train data#1.jsonl"))
            .times(1)
            .returning(|_, _| Ok("d41d8cd98f00b204e9800998ecf8427e".to_string()));
        let gcp = cloud(sci);

        let url = gcp.artifact_url("uid-1", "data", Some("train data#1.jsonl"));
        assert_eq!(url, "gcs://acme-ml-kiln-artifacts/uid-1/data/train%20data%231.jsonl");
        gcp.get_object_checksum(&url).await.unwrap();
    }

    #[tokio::test]
    async fn checksum_is_looked_up_by_bucket_and_object() {
        let mut sci = MockSciClient::new();
        sci.expect_get_object_checksum()
            .with(eq("acme-ml-kiln-artifacts"), eq("uid-1/data/train.jsonl"))
            .returning(|_, _| Ok("d41d8cd98f00b204e9800998ecf8427e".to_string()));

        let sum = cloud(sci)
            .get_object_checksum("gcs://acme-ml-kiln-artifacts/uid-1/data/train.jsonl")
            .await
            .unwrap();
        assert_eq!(sum, "d41d8cd98f00b204e9800998ecf8427e");
    }
}
