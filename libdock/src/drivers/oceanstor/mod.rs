//! `oceanstor` driver: NFS and CIFS shares on an OceanStor NAS.
//!
//! A share is one filesystem plus one share object per protocol. Array ids
//! travel in metadata:
//!
//! | Key                     | Holds                       |
//! |-------------------------|-----------------------------|
//! | `oceanstor.fsId`        | filesystem id               |
//! | `oceanstor.nfsShareId`  | NFS share id                |
//! | `oceanstor.cifsShareId` | CIFS share id               |
//! | `oceanstor.accessId`    | access list entry of an ACL |
//! | `oceanstor.snapshotId`  | filesystem snapshot id      |

pub mod client;

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use self::client::{OceanStorClient, Share, array_name, sectors_to_gb};
use crate::config::{AuthOptions, PoolProperties, default_driver_config, load_yaml};
use crate::context::Context;
use crate::driver::{Driver, Lifecycle, PoolDiscovery};
use crate::drivers::array_rest::{ArrayRest, RestSession};
use crate::error::DockError;
use crate::fileshare::FileShare;
use crate::model::{
    FileShareAclSpec, FileShareSnapshotSpec, FileShareSpec, Metadata, PoolSpec, ResourceKind, ShareProtocol, Status,
    pool_id,
};
use crate::opts::*;
use crate::utils::wait_for;

pub const DRIVER_NAME: &str = "oceanstor";
pub const KEY_FS_ID: &str = "oceanstor.fsId";
pub const KEY_NFS_SHARE_ID: &str = "oceanstor.nfsShareId";
pub const KEY_CIFS_SHARE_ID: &str = "oceanstor.cifsShareId";
pub const KEY_ACCESS_ID: &str = "oceanstor.accessId";
pub const KEY_SNAPSHOT_ID: &str = "oceanstor.snapshotId";

const FS_READY_INTERVAL: Duration = Duration::from_secs(3);
const FS_READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OceanStorConfig {
    pub auth_options: AuthOptions,
    /// Address clients mount shares from; the first endpoint's host otherwise.
    pub logical_port_ip: String,
    pub pool: HashMap<String, PoolProperties>,
}

pub fn share_name(id: &str) -> String {
    format!("share_{}", array_name(id))
}

pub fn snapshot_name(id: &str) -> String {
    format!("share_snapshot_{}", array_name(id))
}

fn share_key(protocol: ShareProtocol) -> &'static str {
    match protocol {
        ShareProtocol::Nfs => KEY_NFS_SHARE_ID,
        ShareProtocol::Cifs => KEY_CIFS_SHARE_ID,
    }
}

/// Where clients mount a share from.
pub fn export_location(protocol: ShareProtocol, ip: &str, name: &str) -> String {
    let name = array_name(name);
    match protocol {
        ShareProtocol::Nfs if matches!(ip.parse::<IpAddr>(), Ok(IpAddr::V6(_))) => format!("[{ip}]:/{name}"),
        ShareProtocol::Nfs => format!("{ip}:/{name}"),
        ShareProtocol::Cifs => format!("\\\\{ip}\\{name}"),
    }
}

/// Host part of an endpoint URL, without IPv6 brackets.
fn endpoint_host(endpoint: &str) -> Option<String> {
    let url = reqwest::Url::parse(endpoint).ok()?;
    let host = url.host_str()?;
    Some(host.trim_start_matches('[').trim_end_matches(']').to_owned())
}

fn required<'a>(metadata: &'a Metadata, key: &str) -> Result<&'a str, DockError> {
    metadata
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DockError::Validation(format!("metadata has no {key}")))
}

pub struct OceanStorDriver {
    conf: OceanStorConfig,
    rest: Option<Arc<dyn ArrayRest>>,
}

impl Default for OceanStorDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl OceanStorDriver {
    pub fn new() -> Self {
        Self {
            conf: OceanStorConfig::default(),
            rest: None,
        }
    }

    /// Driver bound to an existing REST session; `setup` keeps it.
    pub fn with_rest(rest: Arc<dyn ArrayRest>) -> Self {
        Self {
            conf: OceanStorConfig::default(),
            rest: Some(rest),
        }
    }

    fn client(&self) -> Result<OceanStorClient, DockError> {
        self.rest
            .clone()
            .map(OceanStorClient::new)
            .ok_or_else(|| DockError::Config(format!("{DRIVER_NAME} driver is not set up")))
    }

    fn export_ip(&self) -> Result<String, DockError> {
        if !self.conf.logical_port_ip.is_empty() {
            return Ok(self.conf.logical_port_ip.clone());
        }
        self.conf
            .auth_options
            .endpoint_list()
            .first()
            .and_then(|ep| endpoint_host(ep))
            .ok_or_else(|| DockError::Config("no address to export shares from".into()))
    }

    fn availability_zone(&self, pool: &str, requested: &str) -> String {
        if !requested.is_empty() {
            return requested.to_owned();
        }
        self.conf
            .pool
            .get(pool)
            .map(|p| p.availability_zone().to_owned())
            .unwrap_or_else(|| crate::model::DEFAULT_AVAILABILITY_ZONE.to_owned())
    }

    /// Share objects for every protocol, created when missing. Shares made by
    /// this call are recorded in `created` so a failure can remove them.
    async fn ensure_shares(
        &self,
        client: &OceanStorClient,
        protocols: &[ShareProtocol],
        name: &str,
        fs_id: &str,
        created: &mut Vec<(ShareProtocol, String)>,
    ) -> Result<Vec<(ShareProtocol, Share)>, DockError> {
        let mut shares = Vec::new();
        for &protocol in protocols {
            let share = match client.find_share(protocol, name).await? {
                Some(share) => {
                    debug!(%protocol, share = %share.id, "share already exists");
                    share
                }
                None => {
                    let share = client.create_share(protocol, name, fs_id).await?;
                    info!(%protocol, share = %share.id, "share created");
                    created.push((protocol, share.id.clone()));
                    share
                }
            };
            shares.push((protocol, share));
        }
        Ok(shares)
    }
}

#[async_trait]
impl Lifecycle for OceanStorDriver {
    async fn setup(&mut self, config_path: Option<&Path>) -> Result<(), DockError> {
        let default_path = default_driver_config(DRIVER_NAME);
        let path = config_path.unwrap_or(&default_path);
        self.conf = load_yaml(path).await?;
        if self.rest.is_none() {
            let session = RestSession::new(&self.conf.auth_options, client::CODES)?;
            session.connect().await?;
            self.rest = Some(Arc::new(session));
        }
        info!(pools = self.conf.pool.len(), "oceanstor driver ready");
        Ok(())
    }

    async fn unset(&self) -> Result<(), DockError> {
        match &self.rest {
            Some(rest) => rest.close().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PoolDiscovery for OceanStorDriver {
    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<PoolSpec>, DockError> {
        let client = self.client()?;
        let endpoints = self.conf.auth_options.endpoints.clone();
        Ok(client
            .list_pools()
            .await?
            .into_iter()
            .filter_map(|p| {
                let props = self.conf.pool.get(&p.name)?;
                let total = sectors_to_gb(&p.total_capacity);
                Some(PoolSpec {
                    id: pool_id(&format!("{endpoints}:{}", p.id)),
                    total_capacity: total,
                    free_capacity: sectors_to_gb(&p.free_capacity).min(total),
                    storage_type: props.storage_type,
                    availability_zone: props.availability_zone().to_owned(),
                    multi_attach: props.multi_attach,
                    extras: props.extras.clone(),
                    name: p.name,
                })
            })
            .collect())
    }
}

impl Driver for OceanStorDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn as_file_share(&self) -> Option<&dyn FileShare> {
        Some(self)
    }

    fn vendor_id_keys(&self, kind: ResourceKind) -> &'static [&'static str] {
        match kind {
            ResourceKind::FileShare => &[KEY_FS_ID],
            ResourceKind::FileShareSnapshot => &[KEY_SNAPSHOT_ID],
            _ => &[],
        }
    }
}

#[async_trait]
impl FileShare for OceanStorDriver {
    #[instrument(skip(self, ctx, opt), fields(share_id = %opt.id, pool = %opt.pool_name))]
    async fn create_file_share(&self, ctx: &Context, opt: &CreateFileShareOpts) -> Result<FileShareSpec, DockError> {
        if opt.protocols.is_empty() {
            return Err(DockError::Validation("a share needs at least one protocol".into()));
        }
        let client = self.client()?;
        let ip = self.export_ip()?;
        let name = share_name(&opt.id);

        let (fs, fs_created) = match client.find_filesystem(&name).await? {
            Some(fs) => (fs, false),
            None => {
                let pool = client.pool_id(&opt.pool_name).await?;
                let fs = client.create_filesystem(&name, opt.size, &pool).await?;
                info!(fs = %fs.id, %name, "filesystem created");
                (fs, true)
            }
        };

        let mut created = Vec::new();
        let shares = async {
            let fs_id = fs.id.as_str();
            let client = &client;
            wait_for(ctx, "filesystem ready", FS_READY_INTERVAL, FS_READY_TIMEOUT, move || async move {
                Ok(client.get_filesystem(fs_id).await?.is_ready())
            })
            .await?;
            self.ensure_shares(client, &opt.protocols, &name, fs_id, &mut created).await
        }
        .await;

        let shares = match shares {
            Ok(shares) => shares,
            Err(e) => {
                warn!(fs = %fs.id, error = %e, "share creation failed, rolling back");
                for (protocol, id) in &created {
                    if let Err(del) = client.delete_share(*protocol, id).await {
                        warn!(%protocol, share = %id, error = %del, "rollback failed");
                    }
                }
                if fs_created {
                    if let Err(del) = client.delete_filesystem(&fs.id).await {
                        warn!(fs = %fs.id, error = %del, "rollback failed");
                    }
                }
                return Err(e);
            }
        };

        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_FS_ID.to_owned(), fs.id.clone());
        let mut export_locations = Vec::new();
        for (protocol, share) in &shares {
            metadata.insert(share_key(*protocol).to_owned(), share.id.clone());
            export_locations.push(export_location(*protocol, &ip, &name));
        }
        Ok(FileShareSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: name,
            description: opt.description.clone(),
            size: opt.size,
            protocols: opt.protocols.clone(),
            pool_name: opt.pool_name.clone(),
            availability_zone: self.availability_zone(&opt.pool_name, &opt.availability_zone),
            export_locations,
            status: Status::Available,
            metadata,
        })
    }

    /// Refused while any share still has access entries or the filesystem
    /// has snapshots.
    #[instrument(skip(self, _ctx, opt), fields(share_id = %opt.id))]
    async fn delete_file_share(&self, _ctx: &Context, opt: &DeleteFileShareOpts) -> Result<(), DockError> {
        let client = self.client()?;
        let fs_id = required(&opt.metadata, KEY_FS_ID)?;
        let shares: Vec<(ShareProtocol, &String)> = [ShareProtocol::Nfs, ShareProtocol::Cifs]
            .into_iter()
            .filter_map(|p| opt.metadata.get(share_key(p)).map(|id| (p, id)))
            .collect();

        for (protocol, id) in &shares {
            let acls = client.list_access(*protocol, id).await?;
            if !acls.is_empty() {
                return Err(DockError::Backend(format!(
                    "share {} still has {} {protocol} access entries",
                    opt.id,
                    acls.len()
                )));
            }
        }
        let snapshots = client.list_snapshots(fs_id).await?;
        if !snapshots.is_empty() {
            return Err(DockError::Backend(format!(
                "share {} still has {} snapshots",
                opt.id,
                snapshots.len()
            )));
        }

        for (protocol, id) in shares {
            client.delete_share(protocol, id).await?;
            info!(%protocol, share = %id, "share deleted");
        }
        client.delete_filesystem(fs_id).await?;
        info!(fs = %fs_id, "filesystem deleted");
        Ok(())
    }

    #[instrument(skip(self, _ctx, opt), fields(share_id = %opt.share_id, access_to = %opt.access_to))]
    async fn create_file_share_acl(
        &self,
        _ctx: &Context,
        opt: &CreateFileShareAclOpts,
    ) -> Result<FileShareAclSpec, DockError> {
        let client = self.client()?;
        let share = required(&opt.share_metadata, share_key(opt.protocol))?;

        let existing = client
            .list_access(opt.protocol, share)
            .await?
            .into_iter()
            .find(|a| a.name == opt.access_to);
        let access = match existing {
            Some(access) => {
                debug!(access = %access.id, "access entry already exists");
                access
            }
            None => {
                let access = client
                    .allow_access(opt.protocol, share, &opt.access_to, opt.access_level)
                    .await?;
                info!(access = %access.id, level = ?opt.access_level, "access allowed");
                access
            }
        };

        Ok(FileShareAclSpec {
            id: opt.id.clone(),
            share_id: opt.share_id.clone(),
            access_type: opt.access_type,
            access_to: opt.access_to.clone(),
            access_capability: opt.access_capability.clone(),
            access_level: opt.access_level,
            metadata: Metadata::from([(KEY_ACCESS_ID.to_owned(), access.id)]),
        })
    }

    #[instrument(skip(self, _ctx, opt), fields(share_id = %opt.share_id, access_to = %opt.access_to))]
    async fn delete_file_share_acl(&self, _ctx: &Context, opt: &DeleteFileShareAclOpts) -> Result<(), DockError> {
        let client = self.client()?;
        let access_id = match opt.metadata.get(KEY_ACCESS_ID).filter(|v| !v.is_empty()) {
            Some(id) => id.clone(),
            None => {
                let share = required(&opt.share_metadata, share_key(opt.protocol))?;
                let found = client
                    .list_access(opt.protocol, share)
                    .await?
                    .into_iter()
                    .find(|a| a.name == opt.access_to);
                match found {
                    Some(a) => a.id,
                    None => {
                        debug!("access entry already gone");
                        return Ok(());
                    }
                }
            }
        };
        client.remove_access(opt.protocol, &access_id).await?;
        info!(access = %access_id, "access removed");
        Ok(())
    }

    #[instrument(skip(self, _ctx, opt), fields(snapshot_id = %opt.id, share_id = %opt.share_id))]
    async fn create_file_share_snapshot(
        &self,
        _ctx: &Context,
        opt: &CreateFileShareSnapshotOpts,
    ) -> Result<FileShareSnapshotSpec, DockError> {
        let client = self.client()?;
        let fs_id = required(&opt.share_metadata, KEY_FS_ID)?;
        let name = snapshot_name(&opt.id);

        let existing = client
            .list_snapshots(fs_id)
            .await?
            .into_iter()
            .find(|s| s.name == name);
        let snapshot = match existing {
            Some(s) => {
                debug!(snapshot = %s.id, "snapshot already exists");
                s
            }
            None => {
                let s = client.create_snapshot(fs_id, &name).await?;
                info!(snapshot = %s.id, %name, "filesystem snapshot created");
                s
            }
        };

        Ok(FileShareSnapshotSpec {
            id: opt.id.clone(),
            share_id: opt.share_id.clone(),
            name: opt.name.clone(),
            internal_name: name,
            description: opt.description.clone(),
            size: opt.size,
            status: Status::Available,
            metadata: Metadata::from([(KEY_SNAPSHOT_ID.to_owned(), snapshot.id)]),
        })
    }

    #[instrument(skip(self, _ctx, opt), fields(snapshot_id = %opt.id))]
    async fn delete_file_share_snapshot(
        &self,
        _ctx: &Context,
        opt: &DeleteFileShareSnapshotOpts,
    ) -> Result<(), DockError> {
        let id = required(&opt.metadata, KEY_SNAPSHOT_ID)?;
        self.client()?.delete_snapshot(id).await?;
        info!(snapshot = %id, "filesystem snapshot deleted");
        Ok(())
    }
}
