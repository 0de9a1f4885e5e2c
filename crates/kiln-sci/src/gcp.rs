//! GCP backend
//!
//! Workload identity is granted on the target GCP service account's own IAM
//! policy. Object checksums come from Cloud Storage object metadata, where
//! `md5Hash` is base64 and gets re-encoded as hex. REST calls authenticate
//! with application default credentials through `gcp_auth`.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use gcp_auth::TokenProvider;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{Result, SciError};
use crate::policy::{add_workload_identity_member, IamPolicy};
use crate::sigv4::hex;

const IAM_API: &str = "https://iam.googleapis.com/v1";
const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const CLOUD_PLATFORM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Attempts at an etag-guarded policy write before giving up
const MAX_POLICY_ATTEMPTS: usize = 3;

/// GCP REST calls the backend depends on
#[async_trait]
pub trait GcpApi: Send + Sync {
    /// IAM policy of a service account
    async fn get_iam_policy(&self, service_account_email: &str) -> Result<IamPolicy>;

    /// Replace a service account's IAM policy. A stale etag is a
    /// [`SciError::Conflict`].
    async fn set_iam_policy(&self, service_account_email: &str, policy: &IamPolicy) -> Result<()>;

    /// Base64 `md5Hash` of an object, if the object has one
    async fn object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>>;
}

/// GCP [`Backend`]
pub struct GcpBackend {
    project_id: String,
    api: Arc<dyn GcpApi>,
}

impl GcpBackend {
    /// Backend for `project_id` using `api` for REST calls
    pub fn new(project_id: impl Into<String>, api: Arc<dyn GcpApi>) -> Self {
        Self {
            project_id: project_id.into(),
            api,
        }
    }
}

#[async_trait]
impl Backend for GcpBackend {
    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<()> {
        if !principal.ends_with(".iam.gserviceaccount.com") {
            return Err(SciError::invalid_argument(format!(
                "principal {} is not a GCP service account email",
                principal
            )));
        }

        for attempt in 1..=MAX_POLICY_ATTEMPTS {
            let mut policy = self.api.get_iam_policy(principal).await?;
            if !add_workload_identity_member(&mut policy, &self.project_id, namespace, service_account) {
                debug!(principal, namespace, service_account, "workload identity already bound");
                return Ok(());
            }

            match self.api.set_iam_policy(principal, &policy).await {
                Ok(()) => {
                    info!(principal, namespace, service_account, "bound workload identity");
                    return Ok(());
                }
                Err(SciError::Conflict { message }) if attempt < MAX_POLICY_ATTEMPTS => {
                    warn!(principal, attempt, %message, "IAM policy changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(SciError::conflict(format!(
            "IAM policy for {} kept changing during update",
            principal
        )))
    }

    async fn get_object_checksum(&self, bucket: &str, object: &str) -> Result<String> {
        let md5 = self.api.object_md5(bucket, object).await?.ok_or_else(|| {
            SciError::failed_precondition(format!("gs://{}/{} has no md5Hash", bucket, object))
        })?;
        let bytes = STANDARD
            .decode(md5.as_bytes())
            .map_err(|e| SciError::Upstream {
                status: 0,
                message: format!("invalid md5Hash {:?}: {}", md5, e),
            })?;
        Ok(hex(&bytes))
    }
}

// =============================================================================
// REST implementation
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    #[serde(default)]
    md5_hash: Option<String>,
}

/// [`GcpApi`] over the IAM and Cloud Storage JSON APIs
pub struct RestGcpApi {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl RestGcpApi {
    /// REST client using `http`, authenticated by `tokens`
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { http, tokens }
    }

    /// Client authenticated with application default credentials (workload
    /// identity on GKE, a key file or gcloud elsewhere)
    pub async fn from_environment(http: reqwest::Client) -> Result<Self> {
        let tokens = gcp_auth::provider().await?;
        Ok(Self::new(http, tokens))
    }

    /// Bearer token; the provider caches and refreshes it
    async fn token(&self) -> Result<String> {
        let token = self.tokens.token(CLOUD_PLATFORM_SCOPES).await?;
        Ok(token.as_str().to_string())
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let token = self.token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        check(response).await
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SciError::from_http(status.as_u16(), body))
}

#[async_trait]
impl GcpApi for RestGcpApi {
    async fn get_iam_policy(&self, service_account_email: &str) -> Result<IamPolicy> {
        let url = format!(
            "{}/projects/-/serviceAccounts/{}:getIamPolicy",
            IAM_API, service_account_email
        );
        let response = self.post_json(&url, json!({})).await?;
        Ok(response.json().await?)
    }

    async fn set_iam_policy(&self, service_account_email: &str, policy: &IamPolicy) -> Result<()> {
        let url = format!(
            "{}/projects/-/serviceAccounts/{}:setIamPolicy",
            IAM_API, service_account_email
        );
        self.post_json(&url, json!({ "policy": policy })).await?;
        Ok(())
    }

    async fn object_md5(&self, bucket: &str, object: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/b/{}/o/{}",
            STORAGE_API,
            urlencoding::encode(bucket),
            urlencoding::encode(object)
        );
        let token = self.token().await?;
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let metadata: ObjectMetadata = check(response).await?.json().await?;
        Ok(metadata.md5_hash)
    }
}
