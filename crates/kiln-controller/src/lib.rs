//! Kiln controller
//!
//! Each managed kind runs a fixed, linear sequence of stages. A stage reports
//! a [`StageOutcome`](kiln_common::StageOutcome); the first one that is not a
//! success ends the pass, and the lifecycle driver turns the outcome and the
//! accumulated conditions into a status patch and a requeue decision.
//!
//! - Dataset: container → data-load
//! - Model: container → model-train
//! - Server: container → server-deploy

pub mod container;
pub mod context;
pub mod dataset;
pub mod identity;
pub mod job;
pub mod kube_client;
pub mod lifecycle;
pub mod model;
pub mod server;

#[cfg(test)]
mod testing;

pub use context::{Context, ContextBuilder, ControllerConfig};
pub use kube_client::{KubeClient, KubeClientImpl};
pub use lifecycle::{error_policy, ERROR_REQUEUE};
