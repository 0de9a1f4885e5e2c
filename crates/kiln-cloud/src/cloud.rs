//! Cloud strategy trait
//!
//! One implementation per cloud. Reconcilers only ever hold an
//! `Arc<dyn Cloud>`, so adding a cloud means adding an implementation and a
//! registry entry, never touching a reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Volume, VolumeMount};
use tracing::debug;

use kiln_common::{Error, Result};

use crate::bucket::BucketUrl;
use crate::client::SciClient;
use crate::mount::ArtifactMount;

/// Supported clouds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloudName {
    /// Google Cloud
    Gcp,
    /// Amazon Web Services
    Aws,
}

impl CloudName {
    /// Lowercase name used in config and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gcp => "gcp",
            Self::Aws => "aws",
        }
    }
}

impl fmt::Display for CloudName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gcp" => Ok(Self::Gcp),
            "aws" => Ok(Self::Aws),
            other => Err(Error::validation(format!(
                "unknown cloud '{}', expected one of: gcp, aws",
                other
            ))),
        }
    }
}

/// Cloud-specific identity and storage behaviour
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Which cloud this is
    fn name(&self) -> CloudName;

    /// Scheme of artifact URLs on this cloud (`gcs`, `s3`)
    fn url_scheme(&self) -> &'static str;

    /// Bucket all Kiln artifacts are written to
    fn artifact_bucket(&self) -> &str;

    /// Cloud principal bound to a generated Kubernetes service account
    fn principal_for(&self, service_account: &str) -> String;

    /// Annotations that make a Kubernetes service account assume its principal
    fn identity_annotations(&self, service_account: &str) -> BTreeMap<String, String>;

    /// Annotations every pod mounting bucket volumes needs
    fn pod_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Bucket-backed CSI volume
    fn volume_for(&self, name: &str, bucket: &str, read_only: bool) -> Volume;

    /// Client used to reach this cloud's control backend
    fn sci(&self) -> &dyn SciClient;

    /// Read-only mount of an existing artifact at `mount_path`
    fn mount_for(&self, url: &str, volume_name: &str, mount_path: &str) -> Result<ArtifactMount> {
        let parsed = BucketUrl::parse(url)?;
        if parsed.scheme() != self.url_scheme() {
            return Err(Error::url_parse(
                url,
                format!(
                    "scheme '{}' does not match cloud {} ('{}')",
                    parsed.scheme(),
                    self.name(),
                    self.url_scheme()
                ),
            ));
        }

        Ok(ArtifactMount {
            volume: self.volume_for(volume_name, parsed.bucket(), true),
            mount: VolumeMount {
                name: volume_name.to_string(),
                mount_path: mount_path.to_string(),
                sub_path: non_empty(parsed.subpath()),
                read_only: Some(true),
                ..Default::default()
            },
        })
    }

    /// Writable mount of `<uid>/<leaf>` on the artifact bucket
    fn writer_mount(&self, volume_name: &str, uid: &str, leaf: &str, mount_path: &str) -> ArtifactMount {
        ArtifactMount {
            volume: self.volume_for(volume_name, self.artifact_bucket(), false),
            mount: VolumeMount {
                name: volume_name.to_string(),
                mount_path: mount_path.to_string(),
                sub_path: Some(format!("{}/{}", uid, leaf)),
                ..Default::default()
            },
        }
    }

    /// URL of an artifact under `<uid>/<leaf>`; without a file it names the
    /// directory and ends in `/`
    fn artifact_url(&self, uid: &str, leaf: &str, file: Option<&str>) -> String {
        let object = format!("{}/{}/{}", uid, leaf, file.unwrap_or(""));
        BucketUrl::new(self.url_scheme(), self.artifact_bucket(), &object).to_string()
    }

    /// Bind `namespace/service_account` to its cloud principal
    async fn bind_identity(&self, namespace: &str, service_account: &str) -> Result<()> {
        let principal = self.principal_for(service_account);
        debug!(cloud = %self.name(), %principal, namespace, service_account, "binding identity");
        self.sci()
            .bind_identity(&principal, namespace, service_account)
            .await
    }

    /// Checksum of the object an artifact URL points at
    async fn get_object_checksum(&self, url: &str) -> Result<String> {
        let parsed = BucketUrl::parse(url)?;
        self.sci()
            .get_object_checksum(parsed.bucket(), parsed.object())
            .await
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
