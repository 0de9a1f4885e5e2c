//! AWS credentials for the manager
//!
//! Static keys from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` win when set.
//! Otherwise, on EKS with IAM roles for service accounts, the projected token
//! in `AWS_WEB_IDENTITY_TOKEN_FILE` is exchanged for temporary credentials of
//! `AWS_ROLE_ARN` through STS `AssumeRoleWithWebIdentity`. Those are cached and
//! re-exchanged shortly before they expire; the token file is re-read each
//! time since the kubelet rotates it.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SciError};
use crate::sigv4::Credentials;

const STS_VERSION: &str = "2011-06-15";
const DEFAULT_SESSION_NAME: &str = "kiln-aws-manager";

/// Re-exchange web-identity credentials this many minutes before they expire
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Where signing credentials come from
pub enum CredentialSource {
    /// Long-lived keys
    Static(Credentials),
    /// Temporary credentials for a role, assumed with a web-identity token
    WebIdentity(WebIdentity),
}

impl CredentialSource {
    /// Resolve from the process environment
    pub fn from_env(http: reqwest::Client, region: &str) -> Result<Self> {
        Self::from_lookup(http, region, |name| std::env::var(name).ok())
    }

    /// Resolve from `lookup`: static keys first, then web identity
    pub fn from_lookup(
        http: reqwest::Client,
        region: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let (Some(access_key_id), Some(secret_access_key)) =
            (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY"))
        {
            info!(access_key_id = %access_key_id, "using static AWS credentials");
            return Ok(Self::Static(Credentials {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            }));
        }

        if let (Some(role_arn), Some(token_file)) =
            (var("AWS_ROLE_ARN"), var("AWS_WEB_IDENTITY_TOKEN_FILE"))
        {
            info!(role = %role_arn, "using web identity credentials");
            return Ok(Self::WebIdentity(WebIdentity {
                http,
                role_arn,
                token_file: PathBuf::from(token_file),
                session_name: var("AWS_ROLE_SESSION_NAME")
                    .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string()),
                sts_url: format!("https://sts.{}.amazonaws.com/", region),
                cached: Mutex::new(None),
            }));
        }

        Err(SciError::unavailable(
            "no AWS credentials: set AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY or \
             AWS_ROLE_ARN/AWS_WEB_IDENTITY_TOKEN_FILE",
        ))
    }

    /// Credentials valid for signing a request now
    pub async fn current(&self) -> Result<Credentials> {
        match self {
            Self::Static(credentials) => Ok(credentials.clone()),
            Self::WebIdentity(web) => web.current().await,
        }
    }
}

struct Cached {
    credentials: Credentials,
    expires_at: DateTime<Utc>,
}

/// Role credentials assumed with a projected service-account token
pub struct WebIdentity {
    http: reqwest::Client,
    role_arn: String,
    token_file: PathBuf,
    session_name: String,
    sts_url: String,
    cached: Mutex<Option<Cached>>,
}

impl WebIdentity {
    /// Role being assumed
    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    async fn current(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if !needs_refresh(c.expires_at, Utc::now()) {
                return Ok(c.credentials.clone());
            }
        }

        let fresh = self.assume_role().await?;
        debug!(role = %self.role_arn, expires_at = %fresh.expires_at, "assumed role with web identity");
        let credentials = fresh.credentials.clone();
        *cached = Some(fresh);
        Ok(credentials)
    }

    async fn assume_role(&self) -> Result<Cached> {
        let token = tokio::fs::read_to_string(&self.token_file)
            .await
            .map_err(|e| {
                SciError::unavailable(format!(
                    "reading web identity token {}: {}",
                    self.token_file.display(),
                    e
                ))
            })?;

        let form = format!(
            "Action=AssumeRoleWithWebIdentity&RoleArn={}&RoleSessionName={}&Version={}&WebIdentityToken={}",
            urlencoding::encode(&self.role_arn),
            urlencoding::encode(&self.session_name),
            STS_VERSION,
            urlencoding::encode(token.trim())
        );
        let response = self
            .http
            .post(&self.sts_url)
            .header("content-type", "application/x-www-form-urlencoded; charset=utf-8")
            .body(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SciError::from_http(status.as_u16(), body));
        }
        parse_assume_role_response(&body)
    }
}

fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - Duration::minutes(REFRESH_MARGIN_MINUTES) <= now
}

/// Text of the first `<tag>` element in `xml`
fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(xml[start..end].trim())
}

fn parse_assume_role_response(xml: &str) -> Result<Cached> {
    let field = |tag: &str| {
        element_text(xml, tag).ok_or_else(|| SciError::Upstream {
            status: 0,
            message: format!("AssumeRoleWithWebIdentity response has no {}", tag),
        })
    };

    let expiration = field("Expiration")?;
    let expires_at = DateTime::parse_from_rfc3339(expiration)
        .map_err(|e| SciError::Upstream {
            status: 0,
            message: format!("invalid credential expiration {:?}: {}", expiration, e),
        })?
        .with_timezone(&Utc);

    Ok(Cached {
        credentials: Credentials {
            access_key_id: field("AccessKeyId")?.to_string(),
            secret_access_key: field("SecretAccessKey")?.to_string(),
            session_token: Some(field("SessionToken")?.to_string()),
        },
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    const IRSA: &[(&str, &str)] = &[
        ("AWS_ROLE_ARN", "arn:aws:iam::123456789012:role/kiln-sci"),
        ("AWS_WEB_IDENTITY_TOKEN_FILE", "/var/run/secrets/eks.amazonaws.com/serviceaccount/token"),
    ];

    // ==========================================================================
    // Story: the manager finds credentials the way EKS provides them
    // ==========================================================================

    #[test]
    fn static_keys_take_precedence() {
        let mut vars = IRSA.to_vec();
        vars.extend([
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
        ]);
        let source =
            CredentialSource::from_lookup(reqwest::Client::new(), "us-west-2", lookup(&vars)).unwrap();
        match source {
            CredentialSource::Static(c) => {
                assert_eq!(c.access_key_id, "AKIDEXAMPLE");
                assert!(c.session_token.is_none());
            }
            CredentialSource::WebIdentity(_) => panic!("expected static credentials"),
        }
    }

    #[test]
    fn irsa_environment_selects_web_identity() {
        let source =
            CredentialSource::from_lookup(reqwest::Client::new(), "us-west-2", lookup(IRSA)).unwrap();
        match source {
            CredentialSource::WebIdentity(web) => {
                assert_eq!(web.role_arn(), "arn:aws:iam::123456789012:role/kiln-sci");
                assert_eq!(web.sts_url, "https://sts.us-west-2.amazonaws.com/");
                assert_eq!(web.session_name, DEFAULT_SESSION_NAME);
            }
            CredentialSource::Static(_) => panic!("expected web identity"),
        }
    }

    #[test]
    fn no_credentials_is_unavailable() {
        let err = CredentialSource::from_lookup(
            reqwest::Client::new(),
            "us-west-2",
            lookup(&[("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE")]),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SciError::Unavailable { .. }));
    }

    // ==========================================================================
    // Story: temporary credentials are reused until close to expiry
    // ==========================================================================

    #[test]
    fn assume_role_response_is_parsed() {
        let xml = r#"<AssumeRoleWithWebIdentityResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
          <AssumeRoleWithWebIdentityResult>
            <Credentials>
              <AccessKeyId>ASIAEXAMPLE</AccessKeyId>
              <SecretAccessKey>wJalrXUtnFEMI</SecretAccessKey>
              <SessionToken>FwoGZXIvYXdzEXAMPLE</SessionToken>
              <Expiration>2026-10-19T12:00:00Z</Expiration>
            </Credentials>
          </AssumeRoleWithWebIdentityResult>
        </AssumeRoleWithWebIdentityResponse>"#;

        let cached = parse_assume_role_response(xml).unwrap();
        assert_eq!(cached.credentials.access_key_id, "ASIAEXAMPLE");
        assert_eq!(cached.credentials.secret_access_key, "wJalrXUtnFEMI");
        assert_eq!(cached.credentials.session_token.as_deref(), Some("FwoGZXIvYXdzEXAMPLE"));
        assert_eq!(cached.expires_at.to_rfc3339(), "2026-10-19T12:00:00+00:00");

        assert!(parse_assume_role_response("<Error><Code>AccessDenied</Code></Error>").is_err());
    }

    #[test]
    fn refresh_happens_inside_the_margin() {
        let now = Utc::now();
        assert!(!needs_refresh(now + Duration::minutes(30), now));
        assert!(needs_refresh(now + Duration::minutes(4), now));
        assert!(needs_refresh(now - Duration::minutes(1), now));
    }

    #[tokio::test]
    async fn fresh_cached_credentials_skip_the_exchange() {
        let source =
            CredentialSource::from_lookup(reqwest::Client::new(), "us-west-2", lookup(IRSA)).unwrap();
        let CredentialSource::WebIdentity(web) = &source else {
            panic!("expected web identity");
        };
        *web.cached.lock().await = Some(Cached {
            credentials: Credentials {
                access_key_id: "ASIACACHED".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: Some("token".to_string()),
            },
            expires_at: Utc::now() + Duration::hours(1),
        });

        // The token file does not exist, so an exchange would fail.
        let credentials = source.current().await.unwrap();
        assert_eq!(credentials.access_key_id, "ASIACACHED");
    }
}
