//! Shared state handed to every reconcile

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use kiln_cloud::Cloud;

use crate::kube_client::{KubeClient, KubeClientImpl};

/// Image used for git-sourced container builds
pub const DEFAULT_BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:latest";

/// Default delay before re-checking a resource whose stage is still running
pub const DEFAULT_INCOMPLETE_REQUEUE: Duration = Duration::from_secs(30);

/// Operator-level settings the reconcilers read
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Registry built images are pushed to; git builds fail without one
    pub image_registry: Option<String>,
    /// Builder image for git-sourced containers
    pub builder_image: String,
    /// Requeue delay for incomplete stages
    pub incomplete_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            image_registry: None,
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
            incomplete_requeue: DEFAULT_INCOMPLETE_REQUEUE,
        }
    }
}

/// Controller context shared by the Dataset, Model and Server reconcilers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, cloud)
///     .config(config)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Strategy for the cloud this controller runs against
    pub cloud: Arc<dyn Cloud>,
    /// Operator settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, cloud: Arc<dyn Cloud>) -> ContextBuilder {
        ContextBuilder::new(client, cloud)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, cloud: Arc<dyn Cloud>) -> Self {
        Self {
            kube,
            cloud,
            config: ControllerConfig::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    cloud: Arc<dyn Cloud>,
    kube: Option<Arc<dyn KubeClient>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client, cloud: Arc<dyn Cloud>) -> Self {
        Self {
            client,
            cloud,
            kube: None,
            config: ControllerConfig::default(),
        }
    }

    /// Override the Kubernetes client (defaults to [`KubeClientImpl`])
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Set the operator settings
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            cloud: self.cloud,
            config: self.config,
        }
    }
}
