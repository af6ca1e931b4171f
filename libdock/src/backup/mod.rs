//! Snapshot backup to object storage.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`store`] | [`ObjectStore`]: multipart object API the transfer engine drives. |
//! | [`transfer`] | [`ChunkTransfer`]: sequential chunked upload / download. |
//! | [`multicloud`] | `multi-cloud` backup driver over the gateway's S3-style API. |

pub mod multicloud;
pub mod store;
pub mod transfer;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;

use crate::context::Context;
use crate::error::DockError;
use crate::model::{KEY_BUCKET, Metadata};

pub use store::{CompletedPart, ObjectStore};
pub use transfer::{ChunkTransfer, DEFAULT_CHUNK_SIZE, PART_ATTEMPTS};

/// Identity of one backup object.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupSpec {
    /// Object key; the id of the snapshot being backed up.
    pub id: String,
    /// Carries at least `bucket`.
    pub metadata: Metadata,
}

impl BackupSpec {
    pub fn new(id: impl Into<String>, bucket: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(KEY_BUCKET.to_owned(), bucket.into());
        Self {
            id: id.into(),
            metadata,
        }
    }

    pub fn bucket(&self) -> Result<&str, DockError> {
        self.metadata
            .get(KEY_BUCKET)
            .map(String::as_str)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| DockError::Validation(format!("backup {} has no bucket", self.id)))
    }
}

/// Moves a block device image to and from a remote store.
#[async_trait]
pub trait BackupDriver: Send + Sync {
    async fn setup(&mut self, config_path: Option<&Path>) -> Result<(), DockError>;

    async fn clean_up(&self) -> Result<(), DockError>;

    /// Upload `device` and return the backup id the object can be restored by.
    async fn backup(&self, ctx: &Context, spec: &BackupSpec, device: &mut File) -> Result<String, DockError>;

    /// Download backup `backup_id` into `device`.
    async fn restore(
        &self,
        ctx: &Context,
        spec: &BackupSpec,
        backup_id: &str,
        device: &mut File,
    ) -> Result<(), DockError>;

    /// Remove the remote object. Missing objects are not an error.
    async fn delete(&self, ctx: &Context, spec: &BackupSpec) -> Result<(), DockError>;
}
