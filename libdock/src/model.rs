//! Dock data model: volumes, snapshots, attachments, shares, pools, metrics.
//!
//! All records are plain [`Serialize`]/[`Deserialize`] values with `camelCase`
//! wire names. Driver-private state travels in the [`Metadata`] bag and is
//! never interpreted outside the driver that wrote it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DockError;

pub use libtarget::{AccessProtocol, ConnectionInfo};

/// Opaque driver-private key/value bag attached to every resource.
pub type Metadata = HashMap<String, String>;

/// Availability zone used when none is configured.
pub const DEFAULT_AVAILABILITY_ZONE: &str = "default";

/// Metadata key holding the remote object of an uploaded snapshot.
pub const KEY_BACKUP_ID: &str = "backupId";
/// Metadata key holding the bucket of an uploaded snapshot.
pub const KEY_BUCKET: &str = "bucket";

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Creating,
    #[default]
    Available,
    InUse,
    Deleting,
    Error,
    ErrorDeleting,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Block,
    File,
}

/// Resource families, used to key locks and metadata requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Volume,
    Snapshot,
    Attachment,
    SnapshotAttachment,
    VolumeGroup,
    FileShare,
    FileShareAcl,
    FileShareSnapshot,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Volume => "volume",
            Self::Snapshot => "snapshot",
            Self::Attachment => "attachment",
            Self::SnapshotAttachment => "snapshot-attachment",
            Self::VolumeGroup => "volume-group",
            Self::FileShare => "fileshare",
            Self::FileShareAcl => "fileshare-acl",
            Self::FileShareSnapshot => "fileshare-snapshot",
        })
    }
}

// ---------------------------------------------------------------------------
// Block resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeSpec {
    pub id: String,
    pub name: String,
    /// Backend-side name derived from `id`.
    pub internal_name: String,
    pub description: String,
    /// Capacity in GiB.
    pub size: u64,
    pub pool_name: String,
    pub availability_zone: String,
    pub profile: String,
    pub snapshot_id: Option<String>,
    pub status: Status,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotSpec {
    pub id: String,
    pub name: String,
    pub internal_name: String,
    pub volume_id: String,
    /// Always the size of the source volume, in GiB.
    pub size: u64,
    pub description: String,
    pub status: Status,
    pub metadata: Metadata,
}

/// Host an attachment is made for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HostInfo {
    pub initiator: String,
    pub ip: String,
    pub platform: String,
    pub os_type: String,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachmentSpec {
    pub id: String,
    /// Volume or snapshot id the attachment exports.
    pub volume_id: String,
    pub host_info: HostInfo,
    pub access_protocol: AccessProtocol,
    pub connection_info: ConnectionInfo,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeGroupSpec {
    pub id: String,
    pub name: String,
    pub pool_name: String,
    pub status: Status,
    pub volumes: Vec<String>,
}

// ---------------------------------------------------------------------------
// File resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ShareProtocol {
    Nfs,
    Cifs,
}

impl FromStr for ShareProtocol {
    type Err = DockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nfs" => Ok(Self::Nfs),
            "cifs" => Ok(Self::Cifs),
            other => Err(DockError::Validation(format!(
                "unsupported share protocol {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ShareProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nfs => "nfs",
            Self::Cifs => "cifs",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Ip,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccessCapability {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Ro,
    Rw,
}

impl AccessLevel {
    /// Read alone is read-only; any write capability is read-write. A set
    /// without read or write grants nothing.
    pub fn from_capabilities(caps: &[AccessCapability]) -> Option<Self> {
        if caps.contains(&AccessCapability::Write) {
            Some(Self::Rw)
        } else if caps.contains(&AccessCapability::Read) {
            Some(Self::Ro)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FileShareSpec {
    pub id: String,
    pub name: String,
    pub internal_name: String,
    pub description: String,
    pub size: u64,
    pub protocols: Vec<ShareProtocol>,
    pub pool_name: String,
    pub availability_zone: String,
    pub export_locations: Vec<String>,
    pub status: Status,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileShareAclSpec {
    pub id: String,
    pub share_id: String,
    #[serde(rename = "type")]
    pub access_type: AccessType,
    pub access_to: String,
    pub access_capability: Vec<AccessCapability>,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FileShareSnapshotSpec {
    pub id: String,
    pub share_id: String,
    pub name: String,
    pub internal_name: String,
    pub description: String,
    pub size: u64,
    pub status: Status,
    pub metadata: Metadata,
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DataStorage {
    pub provisioning_policy: String,
    pub is_space_efficient: bool,
    pub storage_access_capability: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IoConnectivity {
    pub access_protocol: String,
    pub max_iops: u64,
    pub max_bws: u64,
}

/// Configured pool properties merged into discovered pools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolExtras {
    pub data_storage: DataStorage,
    pub io_connectivity: IoConnectivity,
    pub advanced: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSpec {
    /// Stable uuid v5 of the backend pool identity.
    pub id: String,
    pub name: String,
    /// GiB.
    pub total_capacity: u64,
    /// GiB, never above `total_capacity`.
    pub free_capacity: u64,
    pub storage_type: StorageType,
    pub availability_zone: String,
    pub multi_attach: bool,
    pub extras: PoolExtras,
}

/// Stable pool id for a backend-unique pool identity string.
pub fn pool_id(identity: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, identity.as_bytes()).to_string()
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Volume,
    Disk,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnit {
    Tps,
    Kbs,
    Ms,
    Prcnt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Iops,
    ReadThroughput,
    WriteThroughput,
    ResponseTime,
    ServiceTime,
    Utilization,
}

impl MetricName {
    pub const ALL: [MetricName; 6] = [
        Self::Iops,
        Self::ReadThroughput,
        Self::WriteThroughput,
        Self::ResponseTime,
        Self::ServiceTime,
        Self::Utilization,
    ];

    pub fn unit(&self) -> MetricUnit {
        match self {
            Self::Iops => MetricUnit::Tps,
            Self::ReadThroughput | Self::WriteThroughput => MetricUnit::Kbs,
            Self::ResponseTime | Self::ServiceTime => MetricUnit::Ms,
            Self::Utilization => MetricUnit::Prcnt,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricValue {
    /// Unix seconds at collection time.
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    pub instance_id: String,
    pub instance_name: String,
    pub job: String,
    pub labels: HashMap<String, String>,
    pub component: Component,
    pub name: MetricName,
    pub unit: MetricUnit,
    pub aggr_type: String,
    pub metric_values: Vec<MetricValue>,
}
