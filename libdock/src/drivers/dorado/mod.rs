//! `huawei_dorado` driver: LUNs on an OceanStor Dorado array, mapped to hosts
//! over iSCSI.
//!
//! Array object names are limited to 31 characters, so every dock id is
//! hashed into an `OpenSDS_<hex>` name. The array ids of created objects are
//! kept in metadata under `dorado.lunId` / `dorado.snapshotId`.
//!
//! Mapping a LUN to a host builds the usual chain of array objects:
//!
//! | Object        | Name                              |
//! |---------------|-----------------------------------|
//! | host          | host name, hashed when too long   |
//! | host group    | `OpenSDS_HostGroup_<host id>`     |
//! | LUN group     | `OpenSDS_LunGroup_<host id>`      |
//! | mapping view  | `OpenSDS_MappingView_<host id>`   |

pub mod client;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use self::client::{DoradoClient, STATUS_HEALTH, STATUS_LUNCOPY_COMPLETE, sectors_to_gb};
use crate::block::BlockVolume;
use crate::config::{AuthOptions, PoolProperties, default_driver_config, load_yaml};
use crate::context::Context;
use crate::driver::{Driver, Lifecycle, PoolDiscovery};
use crate::drivers::array_rest::{ArrayRest, RestSession};
use crate::error::DockError;
use crate::model::{
    AccessProtocol, ConnectionInfo, Metadata, PoolSpec, ResourceKind, SnapshotSpec, Status, VolumeSpec, pool_id,
};
use crate::opts::*;
use crate::utils::wait_for;

pub const DRIVER_NAME: &str = "huawei_dorado";
pub const KEY_LUN_ID: &str = "dorado.lunId";
pub const KEY_SNAPSHOT_ID: &str = "dorado.snapshotId";

const NAME_PREFIX: &str = "OpenSDS_";
const MAX_NAME_LEN: usize = 31;
const HOST_GROUP_PREFIX: &str = "OpenSDS_HostGroup_";
const LUN_GROUP_PREFIX: &str = "OpenSDS_LunGroup_";
const MAPPING_VIEW_PREFIX: &str = "OpenSDS_MappingView_";

const LUN_READY_INTERVAL: Duration = Duration::from_secs(2);
const LUN_READY_TIMEOUT: Duration = Duration::from_secs(300);
const LUN_COPY_INTERVAL: Duration = Duration::from_secs(5);
const LUN_COPY_TIMEOUT: Duration = Duration::from_secs(1800);
const ISCSI_PORT: u16 = 3260;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DoradoConfig {
    pub auth_options: AuthOptions,
    /// Address of the array's iSCSI service port hosts log in to.
    pub target_ip: String,
    /// LUN copy speed, 1 (low) to 4 (highest).
    pub copy_speed: u32,
    pub pool: HashMap<String, PoolProperties>,
}

impl Default for DoradoConfig {
    fn default() -> Self {
        Self {
            auth_options: AuthOptions::default(),
            target_ip: String::new(),
            copy_speed: 2,
            pool: HashMap::new(),
        }
    }
}

/// Array name for a dock id: `OpenSDS_` plus a sha256 prefix, 31 characters.
pub fn encode_name(id: &str) -> String {
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{NAME_PREFIX}{}", &digest[..MAX_NAME_LEN - NAME_PREFIX.len()])
}

/// Host names are kept readable unless they exceed the array limit.
pub fn encode_host_name(host: &str) -> String {
    if host.len() <= MAX_NAME_LEN && host.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)) {
        host.to_owned()
    } else {
        encode_name(host)
    }
}

fn required<'a>(metadata: &'a Metadata, key: &str) -> Result<&'a str, DockError> {
    metadata
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DockError::Validation(format!("metadata has no {key}")))
}

pub struct DoradoDriver {
    conf: DoradoConfig,
    rest: Option<Arc<dyn ArrayRest>>,
}

impl Default for DoradoDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DoradoDriver {
    pub fn new() -> Self {
        Self {
            conf: DoradoConfig::default(),
            rest: None,
        }
    }

    /// Driver bound to an existing REST session; `setup` keeps it.
    pub fn with_rest(rest: Arc<dyn ArrayRest>) -> Self {
        Self {
            conf: DoradoConfig::default(),
            rest: Some(rest),
        }
    }

    fn client(&self) -> Result<DoradoClient, DockError> {
        self.rest
            .clone()
            .map(DoradoClient::new)
            .ok_or_else(|| DockError::Config(format!("{DRIVER_NAME} driver is not set up")))
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

    async fn wait_lun_ready(&self, ctx: &Context, client: &DoradoClient, lun_id: &str) -> Result<(), DockError> {
        wait_for(ctx, "lun ready", LUN_READY_INTERVAL, LUN_READY_TIMEOUT, move || async move {
            Ok(client.get_lun(lun_id).await?.is_ready())
        })
        .await
    }

    /// Copy the snapshot's data into a new LUN and drop the copy task.
    async fn copy_from_snapshot(
        &self,
        ctx: &Context,
        client: &DoradoClient,
        snapshot_lun: &str,
        target_lun: &str,
        name: &str,
    ) -> Result<(), DockError> {
        let copy = client
            .create_lun_copy(name, snapshot_lun, target_lun, self.conf.copy_speed)
            .await?;
        let copy_id = copy.as_str();
        let copied = async {
            client.start_lun_copy(copy_id).await?;
            wait_for(ctx, "lun copy", LUN_COPY_INTERVAL, LUN_COPY_TIMEOUT, move || async move {
                let state = client.get_lun_copy(copy_id).await?;
                if state.health_status != STATUS_HEALTH {
                    return Err(DockError::Backend(format!("lun copy {copy_id} is unhealthy")));
                }
                Ok(state.running_status == STATUS_LUNCOPY_COMPLETE)
            })
            .await
        }
        .await;
        if let Err(e) = client.delete_lun_copy(&copy).await {
            warn!(%copy, error = %e, "failed to delete lun copy");
        }
        copied
    }

    fn volume_spec(&self, opt: &CreateVolumeOpts, name: String, lun_id: &str) -> VolumeSpec {
        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_LUN_ID.to_owned(), lun_id.to_owned());
        VolumeSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: name,
            description: opt.description.clone(),
            size: opt.size,
            pool_name: opt.pool_name.clone(),
            availability_zone: self.availability_zone(&opt.pool_name, &opt.availability_zone),
            profile: opt.profile.clone(),
            snapshot_id: opt.snapshot_id.clone(),
            status: Status::Available,
            metadata,
        }
    }
}

#[async_trait]
impl Lifecycle for DoradoDriver {
    async fn setup(&mut self, config_path: Option<&Path>) -> Result<(), DockError> {
        let default_path = default_driver_config(DRIVER_NAME);
        let path = config_path.unwrap_or(&default_path);
        self.conf = load_yaml(path).await?;
        if self.rest.is_none() {
            let session = RestSession::new(&self.conf.auth_options, client::CODES)?;
            session.connect().await?;
            self.rest = Some(Arc::new(session));
        }
        info!(pools = self.conf.pool.len(), target_ip = %self.conf.target_ip, "dorado driver ready");
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
impl PoolDiscovery for DoradoDriver {
    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<PoolSpec>, DockError> {
        let client = self.client()?;
        let endpoints = self.conf.auth_options.endpoints.clone();
        let pools = client
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
            .collect();
        Ok(pools)
    }
}

impl Driver for DoradoDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn as_block(&self) -> Option<&dyn BlockVolume> {
        Some(self)
    }

    fn vendor_id_keys(&self, kind: ResourceKind) -> &'static [&'static str] {
        match kind {
            ResourceKind::Volume => &[KEY_LUN_ID],
            ResourceKind::Snapshot => &[KEY_SNAPSHOT_ID],
            _ => &[],
        }
    }
}

#[async_trait]
impl BlockVolume for DoradoDriver {
    #[instrument(skip(self, ctx, opt), fields(volume_id = %opt.id, pool = %opt.pool_name))]
    async fn create_volume(&self, ctx: &Context, opt: &CreateVolumeOpts) -> Result<VolumeSpec, DockError> {
        let client = self.client()?;
        let name = encode_name(&opt.id);
        if let Some(lun) = client.find_lun(&name).await? {
            debug!(lun = %lun.id, "volume already exists");
            return Ok(self.volume_spec(opt, name, &lun.id));
        }

        let pool = client.pool_id(&opt.pool_name).await?;
        let lun = client.create_lun(&name, opt.size, &opt.description, &pool).await?;
        info!(lun = %lun.id, %name, "lun created");

        let filled = async {
            self.wait_lun_ready(ctx, &client, &lun.id).await?;
            let Some(snapshot_id) = &opt.snapshot_id else {
                return Ok(());
            };
            if opt.snapshot_from_cloud {
                return Ok(());
            }
            let source = match opt.snapshot_metadata.get(KEY_SNAPSHOT_ID) {
                Some(id) => id.clone(),
                None => {
                    client
                        .find_snapshot(&encode_name(snapshot_id))
                        .await?
                        .ok_or_else(|| DockError::NotFound(format!("snapshot {snapshot_id}")))?
                        .id
                }
            };
            self.copy_from_snapshot(ctx, &client, &source, &lun.id, &name).await
        }
        .await;

        if let Err(e) = filled {
            warn!(lun = %lun.id, error = %e, "lun not usable, deleting it");
            if let Err(del) = client.delete_lun(&lun.id).await {
                warn!(lun = %lun.id, error = %del, "cleanup failed");
            }
            return Err(e);
        }
        Ok(self.volume_spec(opt, name, &lun.id))
    }

    async fn pull_volume(
        &self,
        _ctx: &Context,
        id: &str,
        metadata: &Metadata,
    ) -> Result<Option<VolumeSpec>, DockError> {
        let client = self.client()?;
        let lun = match metadata.get(KEY_LUN_ID) {
            Some(lun_id) => match client.get_lun(lun_id).await {
                Ok(lun) => Some(lun),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            },
            None => client.find_lun(&encode_name(id)).await?,
        };
        let Some(lun) = lun else {
            return Ok(None);
        };
        let mut metadata = metadata.clone();
        metadata.insert(KEY_LUN_ID.to_owned(), lun.id.clone());
        Ok(Some(VolumeSpec {
            id: id.to_owned(),
            internal_name: lun.name.clone(),
            description: lun.description.clone(),
            size: sectors_to_gb(&lun.capacity),
            status: if lun.is_ready() { Status::Available } else { Status::Creating },
            metadata,
            ..Default::default()
        }))
    }

    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.id))]
    async fn delete_volume(&self, _ctx: &Context, opt: &DeleteVolumeOpts) -> Result<(), DockError> {
        let lun_id = required(&opt.metadata, KEY_LUN_ID)?;
        self.client()?.delete_lun(lun_id).await?;
        info!(lun = %lun_id, "lun deleted");
        Ok(())
    }

    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.id, size = opt.size))]
    async fn extend_volume(&self, _ctx: &Context, opt: &ExtendVolumeOpts) -> Result<VolumeSpec, DockError> {
        let lun_id = required(&opt.metadata, KEY_LUN_ID)?;
        self.client()?.extend_lun(lun_id, opt.size).await?;
        info!(lun = %lun_id, "lun extended");
        Ok(VolumeSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: encode_name(&opt.id),
            description: opt.description.clone(),
            size: opt.size,
            availability_zone: self.availability_zone(&opt.pool_name, ""),
            pool_name: opt.pool_name.clone(),
            status: Status::Available,
            metadata: opt.metadata.clone(),
            ..Default::default()
        })
    }

    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.volume_id, host = %opt.host_info.host))]
    async fn initialize_connection(
        &self,
        _ctx: &Context,
        opt: &CreateAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError> {
        if opt.access_protocol != AccessProtocol::Iscsi {
            return Err(DockError::NotImplemented(format!(
                "{DRIVER_NAME} over {}",
                opt.access_protocol
            )));
        }
        let lun_id = required(&opt.volume_metadata, KEY_LUN_ID)?;
        let host = &opt.host_info;
        if host.initiator.is_empty() || host.host.is_empty() {
            return Err(DockError::Validation("host name and initiator are required".into()));
        }
        let client = self.client()?;

        let host_id = client.ensure_host(&encode_host_name(&host.host), &host.ip).await?;
        client.ensure_initiator(&host_id, &host.initiator).await?;
        let host_group = client
            .ensure_host_group(&format!("{HOST_GROUP_PREFIX}{host_id}"), &host_id)
            .await?;
        let lun_group = client
            .ensure_lun_group(&format!("{LUN_GROUP_PREFIX}{host_id}"), lun_id)
            .await?;
        client
            .ensure_mapping_view(&format!("{MAPPING_VIEW_PREFIX}{host_id}"), &host_group, &lun_group)
            .await?;

        let iqn = client.target_iqn(&self.conf.target_ip).await?;
        let host_lun = client.host_lun_id(&host_id, lun_id).await?;
        info!(lun = %lun_id, %host_id, host_lun, "lun mapped");
        Ok(ConnectionInfo::new(AccessProtocol::Iscsi)
            .with("targetDiscovered", true)
            .with("targetIQN", vec![iqn])
            .with("targetPortal", vec![format!("{}:{ISCSI_PORT}", self.conf.target_ip)])
            .with("discard", false)
            .with("targetLun", host_lun))
    }

    /// Unmap the LUN. The host's mapping objects are torn down once its LUN
    /// group is empty; teardown failures past that point are logged.
    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.volume_id, host = %opt.host_info.host))]
    async fn terminate_connection(&self, _ctx: &Context, opt: &DeleteAttachmentOpts) -> Result<(), DockError> {
        let lun_id = required(&opt.volume_metadata, KEY_LUN_ID)?;
        let client = self.client()?;
        let Some(host) = client.find_host(&encode_host_name(&opt.host_info.host)).await? else {
            debug!("host already gone");
            return Ok(());
        };
        let view = client
            .find_group("mappingview", &format!("{MAPPING_VIEW_PREFIX}{}", host.id))
            .await?;
        let host_group = client
            .find_group("hostgroup", &format!("{HOST_GROUP_PREFIX}{}", host.id))
            .await?;
        let lun_group = client
            .find_group("lungroup", &format!("{LUN_GROUP_PREFIX}{}", host.id))
            .await?;

        if let Some(group) = &lun_group {
            client.remove_lun_from_group(group, lun_id).await?;
            if client.lun_group_size(group).await? > 0 {
                info!(lun = %lun_id, "lun unmapped, host keeps other luns");
                return Ok(());
            }
        }

        let mut failures = 0;
        let mut step = |what: &str, res: Result<(), DockError>| {
            if let Err(e) = res {
                failures += 1;
                warn!(step = %what, error = %e, "mapping teardown step failed");
            }
        };
        if let Some(view) = &view {
            if let Some(group) = &lun_group {
                step("detach lun group", client.remove_from_view(view, false, group).await);
            }
            if let Some(group) = &host_group {
                step("detach host group", client.remove_from_view(view, true, group).await);
            }
            step("delete mapping view", client.delete_object("mappingview", view).await);
        }
        if let Some(group) = &host_group {
            step("leave host group", client.remove_host_from_group(group, &host.id).await);
            step("delete host group", client.delete_object("hostgroup", group).await);
        }
        if let Some(group) = &lun_group {
            step("delete lun group", client.delete_object("lungroup", group).await);
        }
        if !opt.host_info.initiator.is_empty() {
            step("remove initiator", client.remove_initiator(&opt.host_info.initiator).await);
        }
        step("delete host", client.delete_object("host", &host.id).await);
        info!(lun = %lun_id, host = %host.id, failures, "lun unmapped, host mapping removed");
        Ok(())
    }

    #[instrument(skip(self, _ctx, opt), fields(snapshot_id = %opt.id, volume_id = %opt.volume_id))]
    async fn create_snapshot(&self, _ctx: &Context, opt: &CreateSnapshotOpts) -> Result<SnapshotSpec, DockError> {
        let lun_id = required(&opt.volume_metadata, KEY_LUN_ID)?;
        let client = self.client()?;
        let name = encode_name(&opt.id);

        let snapshot = match client.find_snapshot(&name).await? {
            Some(s) => {
                debug!(snapshot = %s.id, "snapshot already exists");
                s
            }
            None => {
                let s = client.create_snapshot(lun_id, &name, &opt.description).await?;
                if let Err(e) = client.activate_snapshot(&s.id).await {
                    if let Err(del) = client.delete_snapshot(&s.id).await {
                        warn!(snapshot = %s.id, error = %del, "cleanup failed");
                    }
                    return Err(e);
                }
                info!(snapshot = %s.id, %name, "snapshot created");
                s
            }
        };

        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_SNAPSHOT_ID.to_owned(), snapshot.id);
        Ok(SnapshotSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: name,
            volume_id: opt.volume_id.clone(),
            size: opt.size,
            description: opt.description.clone(),
            status: Status::Available,
            metadata,
        })
    }

    #[instrument(skip(self, _ctx, opt), fields(snapshot_id = %opt.id))]
    async fn delete_snapshot(&self, _ctx: &Context, opt: &DeleteSnapshotOpts) -> Result<(), DockError> {
        let snapshot_id = required(&opt.metadata, KEY_SNAPSHOT_ID)?;
        let client = self.client()?;
        match client.stop_snapshot(snapshot_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(snapshot = %snapshot_id, "snapshot already gone");
                return Ok(());
            }
            Err(e) => warn!(snapshot = %snapshot_id, error = %e, "stop failed, deleting anyway"),
        }
        client.delete_snapshot(snapshot_id).await?;
        info!(snapshot = %snapshot_id, "snapshot deleted");
        Ok(())
    }

    async fn initialize_snapshot_connection(
        &self,
        _ctx: &Context,
        _opt: &CreateSnapshotAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError> {
        Err(DockError::NotImplemented(format!("{DRIVER_NAME} snapshot attachments")))
    }

    async fn terminate_snapshot_connection(
        &self,
        _ctx: &Context,
        _opt: &DeleteSnapshotAttachmentOpts,
    ) -> Result<(), DockError> {
        Err(DockError::NotImplemented(format!("{DRIVER_NAME} snapshot attachments")))
    }
}
