//! Common types for Kiln: CRDs, conditions, errors, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod outcome;
pub mod telemetry;

pub use error::Error;
pub use outcome::StageOutcome;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Kiln custom resources
pub const KILN_GROUP: &str = "kiln.dev";

/// API version for all Kiln custom resources
pub const KILN_API_VERSION: &str = "kiln.dev/v1alpha1";

/// Namespace the operator and cloud managers run in
pub const KILN_SYSTEM_NAMESPACE: &str = "kiln-system";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "kiln-controller";

/// Default port for the cloud-control gRPC server (one backend per cloud)
pub const DEFAULT_SCI_PORT: u16 = 10443;
