//! AWS Signature Version 4 request signing
//!
//! Just enough of SigV4 for the handful of IAM and S3 calls the AWS backend
//! makes: header-based signing of a single request.

use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::hmac;
use chrono::{DateTime, Utc};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// AWS signing credentials
#[derive(Clone)]
pub struct Credentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token for temporary credentials
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// A request to sign. Path and query values are given unencoded.
#[derive(Debug)]
pub struct SignableRequest<'a> {
    /// HTTP method
    pub method: &'a str,
    /// Host header value
    pub host: &'a str,
    /// Absolute path, unencoded
    pub path: &'a str,
    /// Query parameters, unencoded
    pub query: &'a [(&'a str, &'a str)],
    /// Extra headers to sign (besides host and x-amz-*)
    pub headers: &'a [(&'a str, &'a str)],
    /// Request body
    pub payload: &'a [u8],
}

/// Region, service and time for a signature
#[derive(Debug)]
pub struct SigningParams<'a> {
    /// Credentials to sign with
    pub credentials: &'a Credentials,
    /// AWS region (`us-east-1` for IAM)
    pub region: &'a str,
    /// Service name (`iam`, `s3`)
    pub service: &'a str,
    /// Signing time
    pub time: DateTime<Utc>,
}

/// Sign a request. Returns the headers to add to it (everything signed except
/// `host` and the caller's own headers, plus `authorization`).
pub fn sign(request: &SignableRequest<'_>, params: &SigningParams<'_>) -> Vec<(String, String)> {
    let amz_date = params.time.format("%Y%m%dT%H%M%SZ").to_string();
    let date = params.time.format("%Y%m%d").to_string();
    let payload_hash = hex(digest(&SHA256, request.payload).as_ref());

    let mut added: Vec<(String, String)> = vec![("x-amz-date".to_string(), amz_date.clone())];
    if params.service == "s3" {
        added.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
    }
    if let Some(token) = &params.credentials.session_token {
        added.push(("x-amz-security-token".to_string(), token.clone()));
    }

    let mut signed: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
        .chain(std::iter::once(("host".to_string(), request.host.to_string())))
        .chain(added.iter().cloned())
        .collect();
    signed.sort();

    let canonical_headers: String = signed
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        canonical_path(request.path),
        canonical_query(request.query),
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date, params.region, params.service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex(digest(&SHA256, canonical_request.as_bytes()).as_ref())
    );

    let key = signing_key(
        &params.credentials.secret_access_key,
        &date,
        params.region,
        params.service,
    );
    let signature = hex(hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, &key), string_to_sign.as_bytes()).as_ref());

    added.push((
        "authorization".to_string(),
        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, params.credentials.access_key_id, scope, signed_headers, signature
        ),
    ));
    added
}

/// Derive the SigV4 signing key for a date, region and service
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let step = |key: &[u8], data: &str| -> Vec<u8> {
        hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key), data.as_bytes())
            .as_ref()
            .to_vec()
    };
    let k_date = step(format!("AWS4{}", secret).as_bytes(), date);
    let k_region = step(&k_date, region);
    let k_service = step(&k_region, service);
    step(&k_service, "aws4_request")
}

/// URI-encode each path segment, keeping `/` separators
pub fn canonical_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Sorted, URI-encoded query string
pub fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Lowercase hex encoding
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
