//! Cloud-control backends for Kiln
//!
//! Each cloud gets one small gRPC server implementing `kiln.sci.v1.CloudControl`.
//! The servers are the only Kiln components holding cloud credentials; the
//! controller reaches them over the network and stays cloud-agnostic.
//!
//! - [`SciServer`] / [`SciService`] - tonic plumbing and request validation
//! - [`Backend`] - what a cloud has to implement
//! - [`GcpBackend`] - IAM workload-identity bindings + GCS object metadata
//! - [`AwsBackend`] - IAM role trust policies + S3 object metadata
//! - [`policy`] - pure merge logic for both clouds' policy documents
//! - [`credentials`] - static or web-identity AWS credentials

pub mod aws;
mod backend;
pub mod credentials;
pub mod error;
pub mod gcp;
pub mod policy;
mod server;
pub mod sigv4;

pub use aws::AwsBackend;
#[cfg(test)]
pub use backend::MockBackend;
pub use backend::Backend;
pub use error::{Result, SciError};
pub use gcp::GcpBackend;
pub use server::{SciServer, SciService};
