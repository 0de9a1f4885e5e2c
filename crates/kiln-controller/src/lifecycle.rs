//! Reconcile lifecycle shared by every kind
//!
//! A pass re-reads the object, runs its stages against a working copy of the
//! status, then [`finish`] folds the stage outcome into conditions, patches
//! the status if anything changed, and picks the next [`Action`].

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, warn};

use kiln_common::conditions::CONDITION_FAILED;
use kiln_common::crd::{Managed, ObjectRef, ResourceKind, ResourceStatus};
use kiln_common::{Error, StageOutcome};

use crate::context::Context;

/// Delay before retrying a reconcile that returned an error
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Fetch the latest copy of `resource`; `None` once it has been deleted
pub async fn refetch<K: Managed>(ctx: &Context, resource: &K) -> Result<Option<K>, Error> {
    let name = resource.name_any();
    let namespace = resource.namespace().ok_or_else(|| {
        Error::validation_for(&name, format!("{} must be namespaced", K::KIND))
    })?;

    match ctx.kube.get_resource(K::KIND, &namespace, &name).await? {
        None => Ok(None),
        Some(found) => K::from_managed(found).map(Some).ok_or_else(|| {
            Error::internal_with_context("lifecycle", format!("lookup of {} {} returned another kind", K::KIND, name))
        }),
    }
}

/// State of a resource another resource consumes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dependency {
    /// Ready, with the artifact URL to mount
    Ready(String),
    /// Exists but is not ready yet
    NotReady,
    /// Does not exist (yet)
    Missing,
}

/// Look up a referenced resource and report whether its artifact can be used
pub async fn dependency(
    ctx: &Context,
    kind: ResourceKind,
    reference: &ObjectRef,
    default_namespace: &str,
) -> Result<Dependency, Error> {
    let namespace = reference.namespace_or(default_namespace);
    let found = ctx.kube.get_resource(kind, namespace, &reference.name).await?;
    Ok(match found {
        None => Dependency::Missing,
        Some(r) => match (r.is_ready(), r.url()) {
            (true, Some(url)) => Dependency::Ready(url.to_string()),
            _ => Dependency::NotReady,
        },
    })
}

/// Record that a stage is waiting on `dependency`
pub fn wait_for(
    status: &mut ResourceStatus,
    condition: &str,
    kind: ResourceKind,
    reference: &ObjectRef,
    dependency: &Dependency,
) -> StageOutcome {
    let state = match dependency {
        Dependency::Missing => "not found",
        _ => "not ready",
    };
    debug!(kind = %kind, dependency = %reference.name, state, "waiting for dependency");
    status.set_condition(
        condition,
        false,
        format!("WaitingFor{}", kind),
        format!("{} {} is {}", kind.lowercase(), reference.name, state),
    );
    StageOutcome::Incomplete
}

/// Validate the spec; an invalid spec is a permanent stage failure
pub fn validate<K: Managed>(resource: &K) -> StageOutcome {
    match resource.validate() {
        Ok(()) => StageOutcome::Success,
        Err(message) => StageOutcome::Fatal(Error::validation_for(resource.name_any(), message)),
    }
}

/// Record the outcome of a pass and decide what happens next
///
/// - `Success`: done until something changes
/// - `Incomplete`: requeue after the configured delay (owned Jobs and
///   Deployments also wake the controller when they change)
/// - permanent `Fatal`: `Failed=True`, first unmet required condition set
///   false with the same reason, no retry until the spec changes
/// - transient `Fatal`: status is still written, then the error goes to
///   [`error_policy`]
pub async fn finish<K: Managed>(
    ctx: &Context,
    resource: &K,
    mut status: ResourceStatus,
    outcome: StageOutcome,
) -> Result<Action, Error> {
    let kind = K::KIND;
    let required = kind.required_conditions();

    let retry = match outcome {
        StageOutcome::Fatal(err) if !err.is_retryable() => {
            error!(error = %err, kind = %kind, "permanent reconcile failure");
            let message = err.to_string();
            if let Some(unmet) = required
                .iter()
                .copied()
                .find(|t| !status.is_condition_true(t))
            {
                status.set_condition(unmet, false, err.reason(), message.clone());
            }
            status.set_condition(CONDITION_FAILED, true, err.reason(), message);
            None
        }
        StageOutcome::Fatal(err) => Some(err),
        StageOutcome::Success | StageOutcome::Incomplete
            if status.is_condition_true(CONDITION_FAILED) =>
        {
            status.set_condition(CONDITION_FAILED, false, "Recovered", "");
            None
        }
        _ => None,
    };

    status.ready = status.all_ready(required);
    status.observed_generation = resource.meta().generation;

    let previous = resource.resource_status().cloned().unwrap_or_default();
    if status != previous {
        let name = resource.name_any();
        let namespace = resource.namespace().unwrap_or_default();
        debug!(ready = status.ready, "patching status");
        let patched = ctx.kube.patch_status(kind, &namespace, &name, &status).await;
        match (&retry, patched) {
            (_, Ok(())) => {}
            (Some(_), Err(e)) => warn!(error = %e, "status patch failed"),
            (None, Err(e)) => return Err(e),
        }
    }

    if let Some(err) = retry {
        return Err(err);
    }

    if status.ready || status.is_condition_true(CONDITION_FAILED) {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ctx.config.incomplete_requeue))
    }
}

/// Error policy shared by the three controllers
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy<K: Managed>(resource: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(
            kind = %K::KIND,
            name = %resource.name_any(),
            error = %error,
            "reconcile failed, will retry"
        );
    } else {
        error!(
            kind = %K::KIND,
            name = %resource.name_any(),
            error = %error,
            "reconcile failed with a permanent error, requeueing after backoff"
        );
    }
    Action::requeue(ERROR_REQUEUE)
}
