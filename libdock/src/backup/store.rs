//! Multipart object storage seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DockError;

/// An uploaded part, as reported back to `complete_multipart`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CompletedPart {
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// S3-style multipart object API.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start a multipart upload and return its upload id.
    async fn init_multipart(&self, bucket: &str, key: &str) -> Result<String, DockError>;

    /// Upload one part and return its ETag. Part numbers start at 1.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, DockError>;

    /// Seal the object from `parts`, given in part-number order.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), DockError>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), DockError>;

    /// Read up to `size` bytes at `offset`; fewer bytes means end of object.
    async fn download_part(&self, bucket: &str, key: &str, offset: u64, size: u64) -> Result<Vec<u8>, DockError>;

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), DockError>;
}
