//! Cloud abstraction for the Kiln controller
//!
//! The controller is cloud-agnostic. Everything that differs between clouds
//! (URL scheme, artifact bucket, principal naming, identity annotations, CSI
//! volume shape) sits behind the [`Cloud`] strategy trait, and everything that
//! needs cloud credentials crosses the `CloudControl` gRPC boundary through a
//! [`SciClient`].
//!
//! # Supported clouds
//!
//! - [`GcpCloud`] - GKE workload identity + Cloud Storage via gcsfuse
//! - [`AwsCloud`] - EKS IRSA + S3 via mountpoint-s3

mod aws;
mod bucket;
mod client;
mod cloud;
mod config;
mod gcp;
mod mount;
mod registry;

pub use aws::AwsCloud;
pub use bucket::BucketUrl;
#[cfg(test)]
pub use client::MockSciClient;
pub use client::{status_to_error, GrpcSciClient, SciClient};
pub use cloud::{Cloud, CloudName};
pub use config::CloudConfig;
pub use gcp::GcpCloud;
pub use mount::{split_mounts, ArtifactMount};
pub use registry::CloudRegistry;
