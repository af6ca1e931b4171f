//! File share capability.
//!
//! A share is only destroyed once it has no ACLs and no snapshots left.

use async_trait::async_trait;

use crate::context::Context;
use crate::error::DockError;
use crate::model::{FileShareAclSpec, FileShareSnapshotSpec, FileShareSpec};
use crate::opts::*;

#[async_trait]
pub trait FileShare: Send + Sync {
    /// Create the backing filesystem and one share per requested protocol.
    async fn create_file_share(
        &self,
        ctx: &Context,
        opt: &CreateFileShareOpts,
    ) -> Result<FileShareSpec, DockError>;

    async fn delete_file_share(&self, ctx: &Context, opt: &DeleteFileShareOpts) -> Result<(), DockError>;

    async fn create_file_share_acl(
        &self,
        ctx: &Context,
        opt: &CreateFileShareAclOpts,
    ) -> Result<FileShareAclSpec, DockError>;

    async fn delete_file_share_acl(&self, ctx: &Context, opt: &DeleteFileShareAclOpts) -> Result<(), DockError>;

    async fn create_file_share_snapshot(
        &self,
        ctx: &Context,
        opt: &CreateFileShareSnapshotOpts,
    ) -> Result<FileShareSnapshotSpec, DockError>;

    async fn delete_file_share_snapshot(
        &self,
        ctx: &Context,
        opt: &DeleteFileShareSnapshotOpts,
    ) -> Result<(), DockError>;
}
