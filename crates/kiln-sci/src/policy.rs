//! Policy document merging
//!
//! Both clouds store "who may become this principal" in a policy document we
//! do not own exclusively. Merges here are additive: the binding for one
//! namespace/service-account pair converges to exactly one entry, every other
//! entry is left untouched, and the return value says whether the document
//! changed so callers can skip the write.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, SciError};

// =============================================================================
// AWS role trust policies
// =============================================================================

/// Audience IRSA tokens are issued for
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

const ASSUME_ROLE_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";
const POLICY_VERSION: &str = "2012-10-17";

/// The cluster OIDC provider and the service account allowed to use it
#[derive(Clone, Debug)]
pub struct WebIdentitySubject<'a> {
    /// IAM OIDC provider ARN (`arn:aws:iam::<acct>:oidc-provider/<url>`)
    pub provider_arn: &'a str,
    /// Provider URL without scheme (`oidc.eks.<region>.amazonaws.com/id/<id>`)
    pub provider_url: &'a str,
    /// Kubernetes namespace
    pub namespace: &'a str,
    /// Kubernetes service account
    pub service_account: &'a str,
}

impl WebIdentitySubject<'_> {
    fn sub_key(&self) -> String {
        format!("{}:sub", self.provider_url)
    }

    fn aud_key(&self) -> String {
        format!("{}:aud", self.provider_url)
    }

    fn subject(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        )
    }

    /// The trust statement this subject should have
    pub fn statement(&self) -> Value {
        let mut string_equals = Map::new();
        string_equals.insert(self.sub_key(), Value::String(self.subject()));
        string_equals.insert(self.aud_key(), Value::String(STS_AUDIENCE.to_string()));
        json!({
            "Effect": "Allow",
            "Principal": { "Federated": self.provider_arn },
            "Action": ASSUME_ROLE_WEB_IDENTITY,
            "Condition": { "StringEquals": string_equals },
        })
    }

    fn matches(&self, statement: &Value) -> bool {
        let federated = &statement["Principal"]["Federated"];
        let same_provider = match federated {
            Value::String(arn) => arn == self.provider_arn,
            Value::Array(arns) => arns.iter().any(|a| a == self.provider_arn),
            _ => false,
        };
        same_provider
            && statement["Condition"]["StringEquals"][self.sub_key()].as_str()
                == Some(self.subject().as_str())
    }
}

/// Merge the web-identity trust statement for `subject` into a role's trust
/// policy. Returns whether the document changed.
pub fn merge_trust_statement(doc: &mut Value, subject: &WebIdentitySubject<'_>) -> Result<bool> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| SciError::failed_precondition("trust policy is not a JSON object"))?;

    let mut changed = false;
    if !obj.contains_key("Version") {
        obj.insert("Version".to_string(), Value::String(POLICY_VERSION.to_string()));
        changed = true;
    }

    // IAM accepts a single statement object in place of an array.
    let statements = match obj.remove("Statement") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(list)) => list,
        Some(single @ Value::Object(_)) => {
            changed = true;
            vec![single]
        }
        Some(other) => {
            obj.insert("Statement".to_string(), other);
            return Err(SciError::failed_precondition(
                "trust policy Statement is neither an object nor an array",
            ));
        }
    };

    let desired = subject.statement();
    let (matching, mut kept): (Vec<Value>, Vec<Value>) =
        statements.into_iter().partition(|s| subject.matches(s));

    let already_converged = matching.len() == 1 && matching[0] == desired;
    if already_converged {
        kept.extend(matching);
    } else {
        kept.push(desired);
        changed = true;
    }

    obj.insert("Statement".to_string(), Value::Array(kept));
    Ok(changed)
}

// =============================================================================
// GCP IAM policies
// =============================================================================

/// Role that lets a Kubernetes service account impersonate a GCP service account
pub const WORKLOAD_IDENTITY_ROLE: &str = "roles/iam.workloadIdentityUser";

/// IAM policy attached to a GCP resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamPolicy {
    /// Policy format version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    /// Concurrency token; a write with a stale etag is rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Role bindings
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Fields we don't interpret (auditConfigs, ...)
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// One role and its members
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Binding {
    /// Role name
    pub role: String,
    /// Principals holding the role
    #[serde(default)]
    pub members: Vec<String>,
    /// Fields we don't interpret (condition, ...)
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Binding {
    fn is_unconditional(&self) -> bool {
        !self.other.contains_key("condition")
    }
}

/// Workload identity member for a Kubernetes service account
pub fn workload_identity_member(project: &str, namespace: &str, service_account: &str) -> String {
    format!(
        "serviceAccount:{}.svc.id.goog[{}/{}]",
        project, namespace, service_account
    )
}

/// Grant `roles/iam.workloadIdentityUser` to the service account's workload
/// identity member. Returns whether the policy changed.
pub fn add_workload_identity_member(
    policy: &mut IamPolicy,
    project: &str,
    namespace: &str,
    service_account: &str,
) -> bool {
    let member = workload_identity_member(project, namespace, service_account);

    let binding = policy
        .bindings
        .iter_mut()
        .find(|b| b.role == WORKLOAD_IDENTITY_ROLE && b.is_unconditional());

    match binding {
        Some(binding) => {
            let before = binding.members.len();
            let mut seen = false;
            binding.members.retain(|m| {
                if *m != member {
                    return true;
                }
                let first = !seen;
                seen = true;
                first
            });
            if !seen {
                binding.members.push(member);
            }
            binding.members.len() != before || !seen
        }
        None => {
            policy.bindings.push(Binding {
                role: WORKLOAD_IDENTITY_ROLE.to_string(),
                members: vec![member],
                other: Map::new(),
            });
            true
        }
    }
}
