//! Driver-facing operation options.
//!
//! The dispatcher validates an [`OpRequest`](crate::dock::OpRequest) and
//! hands drivers one of these typed records. `parent_metadata` is the bag of
//! the resource the operation hangs off (the volume of a snapshot, the share
//! of an ACL, ...).

use serde::{Deserialize, Serialize};

use crate::model::{
    AccessCapability, AccessLevel, AccessProtocol, AccessType, HostInfo, Metadata, ShareProtocol,
};

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateVolumeOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub size: u64,
    pub pool_name: String,
    pub availability_zone: String,
    pub profile: String,
    /// Source snapshot when creating from a snapshot.
    pub snapshot_id: Option<String>,
    pub snapshot_size: u64,
    pub snapshot_from_cloud: bool,
    /// Metadata bag of the source snapshot.
    pub snapshot_metadata: Metadata,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteVolumeOpts {
    pub id: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtendVolumeOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    /// New size in GiB.
    pub size: u64,
    pub pool_name: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateAttachmentOpts {
    pub id: String,
    pub volume_id: String,
    pub host_info: HostInfo,
    pub access_protocol: AccessProtocol,
    /// Metadata bag of the attached volume.
    pub volume_metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteAttachmentOpts {
    pub id: String,
    pub volume_id: String,
    pub host_info: HostInfo,
    pub access_protocol: AccessProtocol,
    pub volume_metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeGroupOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub pool_name: String,
    pub add_volumes: Vec<String>,
    pub remove_volumes: Vec<String>,
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateSnapshotOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub volume_id: String,
    pub size: u64,
    /// Metadata bag of the source volume.
    pub volume_metadata: Metadata,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteSnapshotOpts {
    pub id: String,
    pub volume_id: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateSnapshotAttachmentOpts {
    pub id: String,
    pub snapshot_id: String,
    pub host_info: HostInfo,
    pub access_protocol: AccessProtocol,
    /// Metadata bag of the exported snapshot.
    pub snapshot_metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteSnapshotAttachmentOpts {
    pub id: String,
    pub snapshot_id: String,
    pub host_info: HostInfo,
    pub access_protocol: AccessProtocol,
    pub snapshot_metadata: Metadata,
}

// ---------------------------------------------------------------------------
// File shares
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateFileShareOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub size: u64,
    pub pool_name: String,
    pub availability_zone: String,
    pub protocols: Vec<ShareProtocol>,
    pub profile: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteFileShareOpts {
    pub id: String,
    pub name: String,
    pub protocols: Vec<ShareProtocol>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileShareAclOpts {
    pub id: String,
    pub share_id: String,
    pub protocol: ShareProtocol,
    pub access_type: AccessType,
    pub access_to: String,
    pub access_capability: Vec<AccessCapability>,
    pub access_level: AccessLevel,
    pub share_metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFileShareAclOpts {
    pub id: String,
    pub share_id: String,
    pub protocol: ShareProtocol,
    pub access_type: AccessType,
    pub access_to: String,
    pub metadata: Metadata,
    pub share_metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateFileShareSnapshotOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub share_id: String,
    pub size: u64,
    pub share_metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteFileShareSnapshotOpts {
    pub id: String,
    pub share_id: String,
    pub metadata: Metadata,
    pub share_metadata: Metadata,
}
