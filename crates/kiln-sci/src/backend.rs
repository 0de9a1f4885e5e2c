use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// What a cloud has to provide to serve `CloudControl`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Allow `namespace/service_account` to act as `principal`. Repeating a
    /// bind that already took effect must not change anything.
    async fn bind_identity(&self, principal: &str, namespace: &str, service_account: &str)
        -> Result<()>;

    /// Lowercase hex MD5 of `bucket/object`
    async fn get_object_checksum(&self, bucket: &str, object: &str) -> Result<String>;
}
