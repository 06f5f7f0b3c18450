use crate::error::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;

/// Seam for pushing downloaded media to durable object storage. The gateway
/// ships without a bundled provider; deployments plug their own in and
/// consumers then receive a URL instead of raw bytes.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores the blob and returns a consumer-reachable URL.
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<String, GatewayError>;
}

/// Placeholder used when no storage backend is configured; every call fails
/// with a clear message so media URLs are simply not attached.
pub struct DisabledStorage;

#[async_trait]
impl ObjectStorage for DisabledStorage {
    async fn put_object(
        &self,
        _key: &str,
        _data: Bytes,
        _content_type: Option<&str>,
    ) -> Result<String, GatewayError> {
        Err(GatewayError::Param(
            "object storage is not configured".to_string(),
        ))
    }
}
