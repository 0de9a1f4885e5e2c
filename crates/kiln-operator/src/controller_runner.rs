//! Controller runner - builds one controller future per managed kind
//!
//! Each controller owns the objects its stages create, so a Job finishing or
//! a Deployment becoming ready wakes the owning resource without polling.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use kiln_common::crd::{Dataset, Model, Server};
use kiln_controller::{dataset, error_policy, model, server, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the Dataset, Model and Server controller futures
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    tracing::info!("- Dataset controller");
    let datasets = Controller::new(Api::<Dataset>::all(client.clone()), watcher_config())
        .owns(Api::<Job>::all(client.clone()), watcher_config())
        .shutdown_on_signal()
        .run(dataset::reconcile, error_policy::<Dataset>, ctx.clone())
        .for_each(log_reconcile_result("Dataset"));

    tracing::info!("- Model controller");
    let models = Controller::new(Api::<Model>::all(client.clone()), watcher_config())
        .owns(Api::<Job>::all(client.clone()), watcher_config())
        .shutdown_on_signal()
        .run(model::reconcile, error_policy::<Model>, ctx.clone())
        .for_each(log_reconcile_result("Model"));

    tracing::info!("- Server controller");
    let servers = Controller::new(Api::<Server>::all(client.clone()), watcher_config())
        .owns(Api::<Job>::all(client.clone()), watcher_config())
        .owns(Api::<Deployment>::all(client), watcher_config())
        .shutdown_on_signal()
        .run(server::reconcile, error_policy::<Server>, ctx)
        .for_each(log_reconcile_result("Server"));

    vec![Box::pin(datasets), Box::pin(models), Box::pin(servers)]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
