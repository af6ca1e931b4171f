//! Inbound request record and its validation into driver options.
//!
//! Each `*_opts` method checks every field the target operation needs and
//! returns [`DockError::Validation`] before any driver is touched.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::DockError;
use crate::model::{
    AccessCapability, AccessLevel, AccessProtocol, AccessType, HostInfo, IoConnectivity, KEY_BACKUP_ID,
    KEY_BUCKET, Metadata, ShareProtocol,
};
use crate::opts::*;

/// Backend-agnostic request handed to the dock.
///
/// `parent_metadata` is the bag of the resource the request hangs off: the
/// source volume of a snapshot or attachment, the source snapshot of a
/// create-from-snapshot, the share of an ACL or share snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OpRequest {
    pub id: String,
    pub name: String,
    pub description: String,
    pub size: u64,
    pub pool_name: String,
    pub availability_zone: String,
    /// JSON profile blob; only the access protocol is read from it.
    pub profile: String,
    pub snapshot_id: Option<String>,
    pub snapshot_size: u64,
    pub snapshot_from_cloud: bool,
    pub volume_id: String,
    pub share_id: String,
    pub host_info: HostInfo,
    /// Overrides the profile's protocol. For shares a comma-separated list.
    pub access_protocol: String,
    pub access_capability: Vec<AccessCapability>,
    #[serde(rename = "type")]
    pub access_type: Option<AccessType>,
    pub access_to: String,
    pub add_volumes: Vec<String>,
    pub remove_volumes: Vec<String>,
    pub metadata: Metadata,
    pub parent_metadata: Metadata,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Profile {
    provisioning_properties: ProvisioningProperties,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ProvisioningProperties {
    io_connectivity: IoConnectivity,
}

/// Access protocol named by a profile blob, `None` for an empty profile or
/// one that names none.
pub fn profile_protocol(profile: &str) -> Result<Option<String>, DockError> {
    if profile.trim().is_empty() {
        return Ok(None);
    }
    let profile: Profile = serde_json::from_str(profile)
        .map_err(|e| DockError::Validation(format!("malformed profile: {e}")))?;
    let protocol = profile.provisioning_properties.io_connectivity.access_protocol;
    Ok((!protocol.is_empty()).then_some(protocol))
}

fn non_empty<'a>(value: &'a str, field: &str) -> Result<&'a str, DockError> {
    if value.trim().is_empty() {
        Err(DockError::Validation(format!("{field} is required")))
    } else {
        Ok(value)
    }
}

/// Ids end up in LV names, target IQNs and file names, so path separators,
/// whitespace and a leading `-` are refused.
fn resource_id<'a>(value: &'a str, field: &str) -> Result<&'a str, DockError> {
    let value = non_empty(value, field)?;
    if value.starts_with('-') || value.contains('/') || value.contains('\\') || value.chars().any(char::is_whitespace) {
        return Err(DockError::Validation(format!("{field} {value:?} is not a valid id")));
    }
    Ok(value)
}

fn positive(size: u64, field: &str) -> Result<u64, DockError> {
    if size == 0 {
        Err(DockError::Validation(format!("{field} must be greater than 0")))
    } else {
        Ok(size)
    }
}

/// Reject bags missing any of the driver's vendor id keys.
pub fn require_keys(metadata: &Metadata, keys: &[&str], what: &str) -> Result<(), DockError> {
    let missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| metadata.get(*k).is_none_or(|v| v.is_empty()))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DockError::Validation(format!(
            "{what} metadata is missing {}",
            missing.join(", ")
        )))
    }
}

impl OpRequest {
    fn raw_protocol(&self) -> Result<Option<String>, DockError> {
        if !self.access_protocol.trim().is_empty() {
            return Ok(Some(self.access_protocol.trim().to_owned()));
        }
        profile_protocol(&self.profile)
    }

    /// Block protocol, iSCSI when neither the request nor the profile names one.
    pub fn block_protocol(&self) -> Result<AccessProtocol, DockError> {
        match self.raw_protocol()? {
            Some(p) => Ok(p.parse::<AccessProtocol>()?),
            None => Ok(AccessProtocol::default()),
        }
    }

    /// Share protocols; at least one is required.
    pub fn share_protocols(&self) -> Result<Vec<ShareProtocol>, DockError> {
        let raw = self.raw_protocol()?.unwrap_or_default();
        let mut protocols = Vec::new();
        for p in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let p: ShareProtocol = p.parse()?;
            if !protocols.contains(&p) {
                protocols.push(p);
            }
        }
        if protocols.is_empty() {
            return Err(DockError::Validation("share protocol is required".into()));
        }
        Ok(protocols)
    }

    fn share_protocol(&self) -> Result<ShareProtocol, DockError> {
        match self.share_protocols()?.as_slice() {
            [one] => Ok(*one),
            _ => Err(DockError::Validation(
                "exactly one share protocol is required for an acl".into(),
            )),
        }
    }

    fn checked_access(&self, protocol: ShareProtocol) -> Result<AccessType, DockError> {
        let access_type = self
            .access_type
            .ok_or_else(|| DockError::Validation("access type is required".into()))?;
        let access_to = non_empty(&self.access_to, "accessTo")?;
        match (protocol, access_type) {
            (ShareProtocol::Cifs, AccessType::Ip) => {
                return Err(DockError::Validation(
                    "cifs shares only accept user access".into(),
                ));
            }
            (_, AccessType::Ip) => {
                if access_to.parse::<IpNet>().is_err() && access_to.parse::<IpAddr>().is_err() {
                    return Err(DockError::Validation(format!(
                        "{access_to:?} is not an ip address or network"
                    )));
                }
            }
            (_, AccessType::User) => {}
        }
        Ok(access_type)
    }

    // -----------------------------------------------------------------------
    // Volumes
    // -----------------------------------------------------------------------

    pub fn create_volume_opts(&self) -> Result<CreateVolumeOpts, DockError> {
        resource_id(&self.id, "id")?;
        positive(self.size, "size")?;
        let snapshot_id = self.snapshot_id.clone().filter(|s| !s.is_empty());
        if let Some(id) = &snapshot_id {
            resource_id(id, "snapshotId")?;
            if self.snapshot_size > self.size {
                return Err(DockError::Validation(format!(
                    "size {} is smaller than snapshot size {}",
                    self.size, self.snapshot_size
                )));
            }
            if self.snapshot_from_cloud {
                require_keys(&self.parent_metadata, &[KEY_BACKUP_ID, KEY_BUCKET], "snapshot")?;
            }
        } else if self.snapshot_from_cloud {
            return Err(DockError::Validation(
                "snapshotFromCloud requires snapshotId".into(),
            ));
        }
        Ok(CreateVolumeOpts {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            size: self.size,
            pool_name: self.pool_name.clone(),
            availability_zone: self.availability_zone.clone(),
            profile: self.profile.clone(),
            snapshot_id,
            snapshot_size: self.snapshot_size,
            snapshot_from_cloud: self.snapshot_from_cloud,
            snapshot_metadata: self.parent_metadata.clone(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn delete_volume_opts(&self) -> Result<DeleteVolumeOpts, DockError> {
        resource_id(&self.id, "id")?;
        Ok(DeleteVolumeOpts {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn extend_volume_opts(&self) -> Result<ExtendVolumeOpts, DockError> {
        resource_id(&self.id, "id")?;
        positive(self.size, "size")?;
        Ok(ExtendVolumeOpts {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            size: self.size,
            pool_name: self.pool_name.clone(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn create_attachment_opts(&self) -> Result<CreateAttachmentOpts, DockError> {
        resource_id(&self.volume_id, "volumeId")?;
        Ok(CreateAttachmentOpts {
            id: self.id.clone(),
            volume_id: self.volume_id.clone(),
            host_info: self.host_info.clone(),
            access_protocol: self.block_protocol()?,
            volume_metadata: self.parent_metadata.clone(),
        })
    }

    pub fn delete_attachment_opts(&self) -> Result<DeleteAttachmentOpts, DockError> {
        resource_id(&self.volume_id, "volumeId")?;
        Ok(DeleteAttachmentOpts {
            id: self.id.clone(),
            volume_id: self.volume_id.clone(),
            host_info: self.host_info.clone(),
            access_protocol: self.block_protocol()?,
            volume_metadata: self.parent_metadata.clone(),
        })
    }

    pub fn volume_group_opts(&self) -> Result<VolumeGroupOpts, DockError> {
        resource_id(&self.id, "id")?;
        Ok(VolumeGroupOpts {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            pool_name: self.pool_name.clone(),
            add_volumes: self.add_volumes.clone(),
            remove_volumes: self.remove_volumes.clone(),
            metadata: self.metadata.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn create_snapshot_opts(&self) -> Result<CreateSnapshotOpts, DockError> {
        resource_id(&self.id, "id")?;
        resource_id(&self.volume_id, "volumeId")?;
        positive(self.size, "size")?;
        if self.metadata.get(KEY_BUCKET).is_some_and(|b| b.trim().is_empty()) {
            return Err(DockError::Validation("bucket must not be empty".into()));
        }
        Ok(CreateSnapshotOpts {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            volume_id: self.volume_id.clone(),
            size: self.size,
            volume_metadata: self.parent_metadata.clone(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn delete_snapshot_opts(&self) -> Result<DeleteSnapshotOpts, DockError> {
        resource_id(&self.id, "id")?;
        Ok(DeleteSnapshotOpts {
            id: self.id.clone(),
            volume_id: self.volume_id.clone(),
            metadata: self.metadata.clone(),
        })
    }

    fn attached_snapshot(&self) -> Result<String, DockError> {
        let id = self.snapshot_id.as_deref().unwrap_or_default();
        Ok(resource_id(id, "snapshotId")?.to_owned())
    }

    pub fn create_snapshot_attachment_opts(&self) -> Result<CreateSnapshotAttachmentOpts, DockError> {
        Ok(CreateSnapshotAttachmentOpts {
            id: self.id.clone(),
            snapshot_id: self.attached_snapshot()?,
            host_info: self.host_info.clone(),
            access_protocol: self.block_protocol()?,
            snapshot_metadata: self.parent_metadata.clone(),
        })
    }

    pub fn delete_snapshot_attachment_opts(&self) -> Result<DeleteSnapshotAttachmentOpts, DockError> {
        Ok(DeleteSnapshotAttachmentOpts {
            id: self.id.clone(),
            snapshot_id: self.attached_snapshot()?,
            host_info: self.host_info.clone(),
            access_protocol: self.block_protocol()?,
            snapshot_metadata: self.parent_metadata.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // File shares
    // -----------------------------------------------------------------------

    pub fn create_file_share_opts(&self) -> Result<CreateFileShareOpts, DockError> {
        resource_id(&self.id, "id")?;
        positive(self.size, "size")?;
        Ok(CreateFileShareOpts {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            size: self.size,
            pool_name: self.pool_name.clone(),
            availability_zone: self.availability_zone.clone(),
            protocols: self.share_protocols()?,
            profile: self.profile.clone(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn delete_file_share_opts(&self) -> Result<DeleteFileShareOpts, DockError> {
        resource_id(&self.id, "id")?;
        Ok(DeleteFileShareOpts {
            id: self.id.clone(),
            name: self.name.clone(),
            protocols: self.share_protocols().unwrap_or_default(),
            metadata: self.metadata.clone(),
        })
    }

    pub fn create_file_share_acl_opts(&self) -> Result<CreateFileShareAclOpts, DockError> {
        resource_id(&self.id, "id")?;
        resource_id(&self.share_id, "shareId")?;
        let protocol = self.share_protocol()?;
        let access_type = self.checked_access(protocol)?;
        let access_level = AccessLevel::from_capabilities(&self.access_capability).ok_or_else(|| {
            DockError::Validation("access capability must include read or write".into())
        })?;
        Ok(CreateFileShareAclOpts {
            id: self.id.clone(),
            share_id: self.share_id.clone(),
            protocol,
            access_type,
            access_to: self.access_to.clone(),
            access_capability: self.access_capability.clone(),
            access_level,
            share_metadata: self.parent_metadata.clone(),
        })
    }

    pub fn delete_file_share_acl_opts(&self) -> Result<DeleteFileShareAclOpts, DockError> {
        resource_id(&self.id, "id")?;
        resource_id(&self.share_id, "shareId")?;
        let protocol = self.share_protocol()?;
        let access_type = self.checked_access(protocol)?;
        Ok(DeleteFileShareAclOpts {
            id: self.id.clone(),
            share_id: self.share_id.clone(),
            protocol,
            access_type,
            access_to: self.access_to.clone(),
            metadata: self.metadata.clone(),
            share_metadata: self.parent_metadata.clone(),
        })
    }

    pub fn create_file_share_snapshot_opts(&self) -> Result<CreateFileShareSnapshotOpts, DockError> {
        resource_id(&self.id, "id")?;
        resource_id(&self.share_id, "shareId")?;
        Ok(CreateFileShareSnapshotOpts {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            share_id: self.share_id.clone(),
            size: self.size,
            share_metadata: self.parent_metadata.clone(),
        })
    }

    pub fn delete_file_share_snapshot_opts(&self) -> Result<DeleteFileShareSnapshotOpts, DockError> {
        resource_id(&self.id, "id")?;
        Ok(DeleteFileShareSnapshotOpts {
            id: self.id.clone(),
            share_id: self.share_id.clone(),
            metadata: self.metadata.clone(),
            share_metadata: self.parent_metadata.clone(),
        })
    }
}
