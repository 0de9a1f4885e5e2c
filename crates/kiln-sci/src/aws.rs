//! AWS backend
//!
//! Identity binding edits the trust policy of the principal's IAM role so the
//! cluster's OIDC provider may assume it for one service account. IAM has no
//! etag for trust policies, so edits to one role are serialized in-process and
//! every write is read back until our statement is seen to stick. Checksums
//! come from the S3 ETag, which is the hex MD5 for single-part uploads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::credentials::CredentialSource;
use crate::error::{Result, SciError};
use crate::policy::{merge_trust_statement, WebIdentitySubject};
use crate::sigv4::{self, canonical_path, canonical_query, SignableRequest, SigningParams};

const IAM_HOST: &str = "iam.amazonaws.com";
const IAM_REGION: &str = "us-east-1";
const IAM_VERSION: &str = "2010-05-08";

/// Trust-policy writes per bind before giving up on a contended role
const MAX_TRUST_WRITES: usize = 3;

/// Cluster OIDC provider that issues service-account tokens
#[derive(Clone, Debug)]
pub struct OidcProvider {
    /// Provider ARN
    pub arn: String,
    /// Provider URL without scheme
    pub url: String,
}

impl OidcProvider {
    /// Build from an issuer URL (scheme optional) and an explicit or derived ARN
    pub fn new(account_id: &str, issuer_url: &str, arn: Option<String>) -> Self {
        let url = issuer_url
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string();
        let arn = arn.unwrap_or_else(|| format!("arn:aws:iam::{}:oidc-provider/{}", account_id, url));
        Self { arn, url }
    }
}

/// AWS REST calls the backend depends on
#[async_trait]
pub trait AwsApi: Send + Sync {
    /// Trust policy document of a role
    async fn get_trust_policy(&self, role_name: &str) -> Result<Value>;

    /// Replace a role's trust policy document
    async fn update_trust_policy(&self, role_name: &str, document: &Value) -> Result<()>;

    /// ETag of an object, quotes removed
    async fn object_etag(&self, bucket: &str, key: &str) -> Result<String>;
}

/// AWS [`Backend`]
pub struct AwsBackend {
    oidc: OidcProvider,
    api: Arc<dyn AwsApi>,
    role_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AwsBackend {
    /// Backend trusting `oidc`, using `api` for REST calls
    pub fn new(oidc: OidcProvider, api: Arc<dyn AwsApi>) -> Self {
        Self {
            oidc,
            api,
            role_locks: Mutex::new(HashMap::new()),
        }
    }

    fn role_lock(&self, role: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .role_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(role.to_string()).or_default().clone()
    }
}

/// Role name from a role ARN (`arn:aws:iam::<acct>:role/<path/>name`)
pub fn role_name_from_arn(arn: &str) -> Result<&str> {
    let resource = arn
        .strip_prefix("arn:aws:iam::")
        .and_then(|rest| rest.split_once(':'))
        .map(|(_, resource)| resource)
        .ok_or_else(|| SciError::invalid_argument(format!("{} is not an IAM ARN", arn)))?;
    resource
        .strip_prefix("role/")
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SciError::invalid_argument(format!("{} is not an IAM role ARN", arn)))
}

#[async_trait]
impl Backend for AwsBackend {
    async fn bind_identity(
        &self,
        principal: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<()> {
        let role = role_name_from_arn(principal)?;
        let subject = WebIdentitySubject {
            provider_arn: &self.oidc.arn,
            provider_url: &self.oidc.url,
            namespace,
            service_account,
        };

        let lock = self.role_lock(role);
        let _guard = lock.lock().await;

        // Each write is read back: another manager replica may have replaced
        // the document between our read and write.
        let mut writes = 0;
        loop {
            let mut document = self.api.get_trust_policy(role).await?;
            if !merge_trust_statement(&mut document, &subject)? {
                if writes == 0 {
                    debug!(role, namespace, service_account, "trust policy already up to date");
                } else {
                    info!(role, namespace, service_account, "updated role trust policy");
                }
                return Ok(());
            }

            if writes == MAX_TRUST_WRITES {
                return Err(SciError::conflict(format!(
                    "trust policy for role {} kept changing during update",
                    role
                )));
            }
            if writes > 0 {
                warn!(role, namespace, service_account, writes, "trust statement lost to a concurrent update, rewriting");
            }

            self.api.update_trust_policy(role, &document).await?;
            writes += 1;
        }
    }

    async fn get_object_checksum(&self, bucket: &str, object: &str) -> Result<String> {
        let etag = self.api.object_etag(bucket, object).await?;
        if etag.len() != 32 || !etag.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SciError::failed_precondition(format!(
                "s3://{}/{} has ETag {:?}, which is not an MD5 (multipart or encrypted upload)",
                bucket, object, etag
            )));
        }
        Ok(etag.to_ascii_lowercase())
    }
}

// =============================================================================
// REST implementation
// =============================================================================

/// [`AwsApi`] over SigV4-signed IAM query and S3 REST calls
pub struct RestAwsApi {
    http: reqwest::Client,
    credentials: CredentialSource,
    region: String,
}

impl RestAwsApi {
    /// REST client for S3 in `region`
    pub fn new(http: reqwest::Client, credentials: CredentialSource, region: impl Into<String>) -> Self {
        Self {
            http,
            credentials,
            region: region.into(),
        }
    }

    async fn send(
        &self,
        request: SignableRequest<'_>,
        region: &str,
        service: &str,
    ) -> Result<reqwest::Response> {
        let credentials = self.credentials.current().await?;
        let params = SigningParams {
            credentials: &credentials,
            region,
            service,
            time: Utc::now(),
        };
        let signed = sigv4::sign(&request, &params);

        let mut url = format!("https://{}{}", request.host, canonical_path(request.path));
        if !request.query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query(request.query));
        }
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| SciError::invalid_argument(e.to_string()))?;

        let mut builder = self.http.request(method, url);
        for (name, value) in request.headers.iter().copied() {
            builder = builder.header(name, value);
        }
        for (name, value) in signed {
            builder = builder.header(name, value);
        }
        if !request.payload.is_empty() {
            builder = builder.body(request.payload.to_vec());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains("<Code>NoSuchEntity</Code>") {
            return Err(SciError::not_found(body));
        }
        Err(SciError::from_http(status.as_u16(), body))
    }
}

/// Pull the URL-encoded `AssumeRolePolicyDocument` out of a GetRole response
pub fn extract_trust_policy(xml: &str) -> Result<Value> {
    const OPEN: &str = "<AssumeRolePolicyDocument>";
    const CLOSE: &str = "</AssumeRolePolicyDocument>";

    let start = xml
        .find(OPEN)
        .map(|i| i + OPEN.len())
        .ok_or_else(|| SciError::Upstream {
            status: 0,
            message: "GetRole response has no AssumeRolePolicyDocument".to_string(),
        })?;
    let end = xml[start..]
        .find(CLOSE)
        .map(|i| start + i)
        .ok_or_else(|| SciError::Upstream {
            status: 0,
            message: "unterminated AssumeRolePolicyDocument".to_string(),
        })?;

    let encoded = &xml[start..end];
    let decoded = urlencoding::decode(encoded).map_err(|e| SciError::Upstream {
        status: 0,
        message: format!("AssumeRolePolicyDocument is not valid UTF-8: {}", e),
    })?;
    Ok(serde_json::from_str(&decoded)?)
}

#[async_trait]
impl AwsApi for RestAwsApi {
    async fn get_trust_policy(&self, role_name: &str) -> Result<Value> {
        let request = SignableRequest {
            method: "GET",
            host: IAM_HOST,
            path: "/",
            query: &[
                ("Action", "GetRole"),
                ("RoleName", role_name),
                ("Version", IAM_VERSION),
            ],
            headers: &[],
            payload: b"",
        };
        let body = self.send(request, IAM_REGION, "iam").await?.text().await?;
        extract_trust_policy(&body)
    }

    async fn update_trust_policy(&self, role_name: &str, document: &Value) -> Result<()> {
        let document = serde_json::to_string(document)?;
        let form = format!(
            "Action=UpdateAssumeRolePolicy&PolicyDocument={}&RoleName={}&Version={}",
            urlencoding::encode(&document),
            urlencoding::encode(role_name),
            IAM_VERSION
        );
        let request = SignableRequest {
            method: "POST",
            host: IAM_HOST,
            path: "/",
            query: &[],
            headers: &[("content-type", "application/x-www-form-urlencoded; charset=utf-8")],
            payload: form.as_bytes(),
        };
        self.send(request, IAM_REGION, "iam").await?;
        Ok(())
    }

    async fn object_etag(&self, bucket: &str, key: &str) -> Result<String> {
        let host = format!("{}.s3.{}.amazonaws.com", bucket, self.region);
        let path = format!("/{}", key);
        let request = SignableRequest {
            method: "HEAD",
            host: &host,
            path: &path,
            query: &[],
            headers: &[],
            payload: b"",
        };
        let response = self.send(request, &self.region, "s3").await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SciError::Upstream {
                status: 200,
                message: format!("HEAD s3://{}/{} returned no ETag", bucket, key),
            })?;
        Ok(etag.trim_matches('"').to_string())
    }
}
