//! Protocol buffer definitions for the Kiln cloud-control service.
//!
//! The controller never holds cloud credentials. Everything that touches IAM
//! or object metadata goes through `CloudControl`, served by one manager
//! binary per cloud inside `kiln-system`.
//!
//! - [`BindIdentityRequest`]: let a namespace/service-account act as a cloud principal
//! - [`GetObjectChecksumRequest`]: MD5 of an object in the artifact bucket
//!
//! ```rust,ignore
//! use kiln_proto::cloud_control_client::CloudControlClient;
//! use kiln_proto::GetObjectChecksumRequest;
//!
//! let mut client = CloudControlClient::connect("http://kiln-sci.kiln-system.svc:10443").await?;
//! let resp = client
//!     .get_object_checksum(GetObjectChecksumRequest {
//!         bucket_name: "acme-kiln-artifacts".to_string(),
//!         object_name: "uid/data/train.jsonl".to_string(),
//!     })
//!     .await?;
//! ```

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated protobuf types from sci.proto
pub mod sci {
    /// Version 1 of the cloud-control protocol
    pub mod v1 {
        tonic::include_proto!("kiln.sci.v1");
    }
}

pub use sci::v1::*;
