//! Block volume capability.
//!
//! Create and delete are idempotent on the caller-supplied id: creating an
//! existing volume returns an equivalent record, deleting a missing one
//! succeeds.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::DockError;
use crate::model::{ConnectionInfo, Metadata, ResourceKind, SnapshotSpec, VolumeGroupSpec, VolumeSpec};
use crate::opts::*;

#[async_trait]
pub trait BlockVolume: Send + Sync {
    async fn create_volume(&self, ctx: &Context, opt: &CreateVolumeOpts) -> Result<VolumeSpec, DockError>;

    /// Current backend view of a volume, `None` when the backend has no record.
    async fn pull_volume(
        &self,
        ctx: &Context,
        id: &str,
        metadata: &Metadata,
    ) -> Result<Option<VolumeSpec>, DockError>;

    async fn delete_volume(&self, ctx: &Context, opt: &DeleteVolumeOpts) -> Result<(), DockError>;

    async fn extend_volume(&self, ctx: &Context, opt: &ExtendVolumeOpts) -> Result<VolumeSpec, DockError>;

    /// Export the volume to a host.
    async fn initialize_connection(
        &self,
        ctx: &Context,
        opt: &CreateAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError>;

    async fn terminate_connection(&self, ctx: &Context, opt: &DeleteAttachmentOpts) -> Result<(), DockError>;

    async fn create_snapshot(&self, ctx: &Context, opt: &CreateSnapshotOpts) -> Result<SnapshotSpec, DockError>;

    async fn delete_snapshot(&self, ctx: &Context, opt: &DeleteSnapshotOpts) -> Result<(), DockError>;

    async fn initialize_snapshot_connection(
        &self,
        ctx: &Context,
        opt: &CreateSnapshotAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError>;

    async fn terminate_snapshot_connection(
        &self,
        ctx: &Context,
        opt: &DeleteSnapshotAttachmentOpts,
    ) -> Result<(), DockError>;

    async fn create_volume_group(
        &self,
        _ctx: &Context,
        _opt: &VolumeGroupOpts,
    ) -> Result<VolumeGroupSpec, DockError> {
        Err(DockError::NotImplemented("volume groups".into()))
    }

    async fn update_volume_group(
        &self,
        _ctx: &Context,
        _opt: &VolumeGroupOpts,
    ) -> Result<VolumeGroupSpec, DockError> {
        Err(DockError::NotImplemented("volume groups".into()))
    }

    async fn delete_volume_group(&self, _ctx: &Context, _opt: &VolumeGroupOpts) -> Result<(), DockError> {
        Err(DockError::NotImplemented("volume groups".into()))
    }

    /// Local block device of a volume or snapshot, for backends whose devices
    /// live on this host.
    fn device_path(&self, _kind: ResourceKind, _metadata: &Metadata) -> Option<PathBuf> {
        None
    }
}
