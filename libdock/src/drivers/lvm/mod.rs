//! `lvm` driver: logical volumes on local volume groups, exported over iSCSI
//! or NVMe-oF by [`libtarget`].
//!
//! Each configured pool is a volume group. Volumes are `volume-<id>` LVs and
//! snapshots are `_snapshot-<id>` copy-on-write LVs; their device paths are
//! kept in metadata under `lvPath` / `lvsPath`.
//!
//! ```yaml
//! tgtBindIp: 10.0.0.5
//! tgtConfDir: /etc/tgt/conf.d
//! enableChapAuth: true
//! pool:
//!   opensds-volumes-default:
//!     storageType: block
//!     availabilityZone: default
//!     extras:
//!       ioConnectivity:
//!         accessProtocol: iscsi
//! ```

pub mod cli;
pub mod metrics;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libtarget::{ChapCredentials, ExportKind, ExportRequest, Exporter, Executor, ShellExecutor, TargetConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use self::cli::Cli;
use crate::block::BlockVolume;
use crate::config::{PoolProperties, default_driver_config, load_yaml};
use crate::context::Context;
use crate::driver::{Driver, Lifecycle, PoolDiscovery};
use crate::error::DockError;
use crate::metric::Metric;
use crate::model::{ConnectionInfo, Metadata, PoolSpec, ResourceKind, SnapshotSpec, Status, VolumeSpec, pool_id};
use crate::opts::*;

pub const DRIVER_NAME: &str = "lvm";
pub const KEY_LV_PATH: &str = "lvPath";
pub const KEY_LVS_PATH: &str = "lvsPath";

const VOLUME_PREFIX: &str = "volume-";
const SNAPSHOT_PREFIX: &str = "_snapshot-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LvmConfig {
    #[serde(flatten)]
    pub target: TargetConfig,
    pub enable_chap_auth: bool,
    pub pool: HashMap<String, PoolProperties>,
}

pub fn volume_name(id: &str) -> String {
    format!("{VOLUME_PREFIX}{id}")
}

pub fn snapshot_name(id: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{id}")
}

fn lv_path(vg: &str, name: &str) -> String {
    format!("/dev/{vg}/{name}")
}

/// `/dev/<vg>/<lv>` → `(vg, lv)`.
fn split_lv_path(path: &str) -> Result<(String, String), DockError> {
    let mut parts = Path::new(path).iter().rev();
    match (parts.next(), parts.next()) {
        (Some(lv), Some(vg)) if vg != "dev" && vg != "/" => Ok((
            vg.to_string_lossy().into_owned(),
            lv.to_string_lossy().into_owned(),
        )),
        _ => Err(DockError::Validation(format!("malformed lv path {path:?}"))),
    }
}

fn required<'a>(metadata: &'a Metadata, key: &str) -> Result<&'a str, DockError> {
    metadata
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DockError::Validation(format!("metadata has no {key}")))
}

struct Session {
    conf: LvmConfig,
    cli: Cli,
    exporter: Exporter,
}

pub struct LvmDriver {
    exec: Arc<dyn Executor>,
    session: Option<Session>,
}

impl Default for LvmDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LvmDriver {
    pub fn new() -> Self {
        Self::with_executor(Arc::new(ShellExecutor))
    }

    /// Driver running its LVM and target commands through `exec`.
    pub fn with_executor(exec: Arc<dyn Executor>) -> Self {
        Self { exec, session: None }
    }

    fn session(&self) -> Result<&Session, DockError> {
        self.session
            .as_ref()
            .ok_or_else(|| DockError::Config(format!("{DRIVER_NAME} driver is not set up")))
    }

    fn chap(&self) -> Result<Option<ChapCredentials>, DockError> {
        Ok(self.session()?.conf.enable_chap_auth.then(ChapCredentials::generate))
    }

    fn availability_zone(&self, pool: &str, requested: &str) -> Result<String, DockError> {
        if !requested.is_empty() {
            return Ok(requested.to_owned());
        }
        let session = self.session()?;
        Ok(session
            .conf
            .pool
            .get(pool)
            .map(|p| p.availability_zone().to_owned())
            .unwrap_or_else(|| crate::model::DEFAULT_AVAILABILITY_ZONE.to_owned()))
    }

    /// Configured volume group holding `name`, if any.
    async fn find_vg(&self, name: &str) -> Result<Option<String>, DockError> {
        let session = self.session()?;
        for vg in session.conf.pool.keys() {
            match session.cli.lv(vg, name).await {
                Ok(Some(_)) => return Ok(Some(vg.clone())),
                Ok(None) => {}
                Err(e) => debug!(%vg, error = %e, "lookup failed"),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Lifecycle for LvmDriver {
    async fn setup(&mut self, config_path: Option<&Path>) -> Result<(), DockError> {
        let default_path = default_driver_config(DRIVER_NAME);
        let path = config_path.unwrap_or(&default_path);
        let conf: LvmConfig = load_yaml(path).await?;
        if conf.pool.is_empty() {
            warn!(path = %path.display(), "no pools configured");
        }
        let exporter = Exporter::new(&conf.target, self.exec.clone());
        info!(pools = conf.pool.len(), bind_ip = %conf.target.tgt_bind_ip, "lvm driver ready");
        self.session = Some(Session {
            conf,
            cli: Cli::new(self.exec.clone()),
            exporter,
        });
        Ok(())
    }

    async fn unset(&self) -> Result<(), DockError> {
        Ok(())
    }
}

#[async_trait]
impl PoolDiscovery for LvmDriver {
    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<PoolSpec>, DockError> {
        let session = self.session()?;
        let vgs = session.cli.list_vgs().await?;
        let pools = vgs
            .into_iter()
            .filter_map(|vg| {
                let props = session.conf.pool.get(&vg.name)?;
                let total = vg.total_gb.floor() as u64;
                Some(PoolSpec {
                    id: pool_id(&vg.uuid),
                    total_capacity: total,
                    free_capacity: (vg.free_gb.floor() as u64).min(total),
                    storage_type: props.storage_type,
                    availability_zone: props.availability_zone().to_owned(),
                    multi_attach: props.multi_attach,
                    extras: props.extras.clone(),
                    name: vg.name,
                })
            })
            .collect();
        Ok(pools)
    }
}

impl Driver for LvmDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn as_block(&self) -> Option<&dyn BlockVolume> {
        Some(self)
    }

    fn as_metric(&self) -> Option<&dyn Metric> {
        Some(self)
    }

    fn vendor_id_keys(&self, kind: ResourceKind) -> &'static [&'static str] {
        match kind {
            ResourceKind::Volume => &[KEY_LV_PATH],
            ResourceKind::Snapshot => &[KEY_LVS_PATH],
            _ => &[],
        }
    }
}

#[async_trait]
impl BlockVolume for LvmDriver {
    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.id, vg = %opt.pool_name))]
    async fn create_volume(&self, _ctx: &Context, opt: &CreateVolumeOpts) -> Result<VolumeSpec, DockError> {
        let session = self.session()?;
        let vg = &opt.pool_name;
        if !session.conf.pool.contains_key(vg) {
            return Err(DockError::Validation(format!("pool {vg} is not configured")));
        }
        let name = volume_name(&opt.id);

        if session.cli.lv(vg, &name).await?.is_some() {
            debug!(lv = %name, "volume already exists");
        } else {
            session.cli.create_volume(vg, &name, opt.size).await?;
            info!(lv = %name, size = opt.size, "volume created");
        }

        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_LV_PATH.to_owned(), lv_path(vg, &name));
        Ok(VolumeSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: name,
            description: opt.description.clone(),
            size: opt.size,
            pool_name: vg.clone(),
            availability_zone: self.availability_zone(vg, &opt.availability_zone)?,
            profile: opt.profile.clone(),
            snapshot_id: opt.snapshot_id.clone(),
            status: Status::Available,
            metadata,
        })
    }

    async fn pull_volume(
        &self,
        _ctx: &Context,
        id: &str,
        metadata: &Metadata,
    ) -> Result<Option<VolumeSpec>, DockError> {
        let session = self.session()?;
        let (vg, name) = match metadata.get(KEY_LV_PATH) {
            Some(path) => split_lv_path(path)?,
            None => {
                let name = volume_name(id);
                match self.find_vg(&name).await? {
                    Some(vg) => (vg, name),
                    None => return Ok(None),
                }
            }
        };
        let Some(lv) = session.cli.lv(&vg, &name).await? else {
            return Ok(None);
        };
        let mut metadata = metadata.clone();
        metadata.insert(KEY_LV_PATH.to_owned(), lv_path(&vg, &name));
        Ok(Some(VolumeSpec {
            id: id.to_owned(),
            internal_name: name,
            size: lv.size_gb.ceil() as u64,
            availability_zone: self.availability_zone(&vg, "")?,
            pool_name: vg,
            status: Status::Available,
            metadata,
            ..Default::default()
        }))
    }

    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.id))]
    async fn delete_volume(&self, _ctx: &Context, opt: &DeleteVolumeOpts) -> Result<(), DockError> {
        let session = self.session()?;
        let (vg, name) = split_lv_path(required(&opt.metadata, KEY_LV_PATH)?)?;
        let Some(lv) = session.cli.lv(&vg, &name).await? else {
            debug!(lv = %name, "volume already gone");
            return Ok(());
        };
        if lv.has_snapshot() {
            return Err(DockError::Backend(format!(
                "volume {} still has snapshots",
                opt.id
            )));
        }
        session.cli.delete(&vg, &name).await?;
        info!(lv = %name, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.id, size = opt.size))]
    async fn extend_volume(&self, _ctx: &Context, opt: &ExtendVolumeOpts) -> Result<VolumeSpec, DockError> {
        let session = self.session()?;
        let path = required(&opt.metadata, KEY_LV_PATH)?;
        let (vg, name) = split_lv_path(path)?;
        session.cli.extend(&vg, &name, opt.size).await?;
        info!(lv = %name, "volume extended");
        Ok(VolumeSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: name,
            description: opt.description.clone(),
            size: opt.size,
            availability_zone: self.availability_zone(&vg, "")?,
            pool_name: vg,
            status: Status::Available,
            metadata: opt.metadata.clone(),
            ..Default::default()
        })
    }

    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.volume_id, protocol = %opt.access_protocol))]
    async fn initialize_connection(
        &self,
        _ctx: &Context,
        opt: &CreateAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError> {
        let session = self.session()?;
        let path = required(&opt.volume_metadata, KEY_LV_PATH)?;
        let req = ExportRequest {
            volume_id: opt.volume_id.clone(),
            device_path: PathBuf::from(path),
            host_ip: opt.host_info.ip.clone(),
            initiator: opt.host_info.initiator.clone(),
            chap: self.chap()?,
        };
        Ok(session
            .exporter
            .create_export(ExportKind::Volume, opt.access_protocol, req)
            .await?)
    }

    #[instrument(skip(self, _ctx, opt), fields(volume_id = %opt.volume_id))]
    async fn terminate_connection(&self, _ctx: &Context, opt: &DeleteAttachmentOpts) -> Result<(), DockError> {
        let session = self.session()?;
        session
            .exporter
            .remove_export(&opt.volume_id, &opt.host_info.ip)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, _ctx, opt), fields(snapshot_id = %opt.id, volume_id = %opt.volume_id))]
    async fn create_snapshot(&self, _ctx: &Context, opt: &CreateSnapshotOpts) -> Result<SnapshotSpec, DockError> {
        let session = self.session()?;
        let (vg, source) = split_lv_path(required(&opt.volume_metadata, KEY_LV_PATH)?)?;
        let name = snapshot_name(&opt.id);

        if session.cli.lv(&vg, &name).await?.is_some() {
            debug!(lv = %name, "snapshot already exists");
        } else {
            session.cli.create_snapshot(&vg, &source, &name, opt.size).await?;
            info!(lv = %name, "snapshot created");
        }

        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_LVS_PATH.to_owned(), lv_path(&vg, &name));
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
        let session = self.session()?;
        let (vg, name) = split_lv_path(required(&opt.metadata, KEY_LVS_PATH)?)?;
        if session.cli.lv(&vg, &name).await?.is_none() {
            debug!(lv = %name, "snapshot already gone");
            return Ok(());
        }
        session.cli.delete(&vg, &name).await?;
        info!(lv = %name, "snapshot deleted");
        Ok(())
    }

    #[instrument(skip(self, _ctx, opt), fields(snapshot_id = %opt.snapshot_id))]
    async fn initialize_snapshot_connection(
        &self,
        _ctx: &Context,
        opt: &CreateSnapshotAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError> {
        let session = self.session()?;
        let path = required(&opt.snapshot_metadata, KEY_LVS_PATH)?;
        let req = ExportRequest {
            volume_id: opt.snapshot_id.clone(),
            device_path: PathBuf::from(path),
            host_ip: opt.host_info.ip.clone(),
            initiator: opt.host_info.initiator.clone(),
            chap: self.chap()?,
        };
        Ok(session
            .exporter
            .create_export(ExportKind::Snapshot, opt.access_protocol, req)
            .await?)
    }

    #[instrument(skip(self, _ctx, opt), fields(snapshot_id = %opt.snapshot_id))]
    async fn terminate_snapshot_connection(
        &self,
        _ctx: &Context,
        opt: &DeleteSnapshotAttachmentOpts,
    ) -> Result<(), DockError> {
        let session = self.session()?;
        session
            .exporter
            .remove_export(&opt.snapshot_id, &opt.host_info.ip)
            .await?;
        Ok(())
    }

    fn device_path(&self, kind: ResourceKind, metadata: &Metadata) -> Option<PathBuf> {
        let key = match kind {
            ResourceKind::Volume => KEY_LV_PATH,
            ResourceKind::Snapshot => KEY_LVS_PATH,
            _ => return None,
        };
        metadata.get(key).map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use libtarget::TargetError;

    use crate::error::ErrorKind;

    /// Answers `lvs` from a fixed listing and records every command.
    struct Script {
        lvs: Mutex<String>,
        calls: Mutex<Vec<String>>,
    }

    impl Script {
        fn new(lvs: &str) -> Arc<Self> {
            Arc::new(Self {
                lvs: Mutex::new(lvs.to_owned()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self, program: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(program))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Executor for Script {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String, TargetError> {
            self.calls.lock().unwrap().push(format!("{program} {}", args.join(" ")));
            match program {
                "lvs" => Ok(self.lvs.lock().unwrap().clone()),
                "vgs" => Ok("  vg0 20.50 8.25 uuid-vg0\n  scratch 5.00 5.00 uuid-scratch\n".into()),
                _ => Ok(String::new()),
            }
        }
    }

    async fn driver(script: Arc<Script>) -> (LvmDriver, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lvm.yaml");
        std::fs::write(
            &path,
            format!(
                "tgtBindIp: 10.0.0.5\ntgtConfDir: {}\npool:\n  vg0:\n    availabilityZone: az-1\n",
                dir.path().join("tgt").display()
            ),
        )
        .unwrap();
        let mut driver = LvmDriver::with_executor(script);
        driver.setup(Some(&path)).await.unwrap();
        (driver, dir)
    }

    #[test]
    fn lv_paths_split() {
        assert_eq!(
            split_lv_path("/dev/vg0/volume-a").unwrap(),
            ("vg0".to_owned(), "volume-a".to_owned())
        );
        assert!(split_lv_path("/dev/volume-a").is_err());
        assert!(split_lv_path("").is_err());
    }

    #[tokio::test]
    async fn create_volume_is_idempotent() {
        let script = Script::new("");
        let (driver, _dir) = driver(script.clone()).await;
        let opt = CreateVolumeOpts {
            id: "v1".into(),
            size: 2,
            pool_name: "vg0".into(),
            ..Default::default()
        };
        let spec = driver.create_volume(&Context::background(), &opt).await.unwrap();
        assert_eq!(spec.metadata[KEY_LV_PATH], "/dev/vg0/volume-v1");
        assert_eq!(spec.availability_zone, "az-1");

        *script.lvs.lock().unwrap() = "  vg0 volume-v1 2.00 -wi-a-----\n".into();
        let again = driver.create_volume(&Context::background(), &opt).await.unwrap();
        assert_eq!(again, spec);
        assert_eq!(script.calls("lvcreate").len(), 1);
        assert!(script.calls("lvcreate")[0].contains("-Z n -n volume-v1 -L 2g vg0"));
    }

    #[tokio::test]
    async fn create_volume_rejects_unknown_pool() {
        let (driver, _dir) = driver(Script::new("")).await;
        let opt = CreateVolumeOpts {
            id: "v1".into(),
            size: 1,
            pool_name: "scratch".into(),
            ..Default::default()
        };
        let err = driver.create_volume(&Context::background(), &opt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn delete_missing_volume_succeeds() {
        let script = Script::new("");
        let (driver, _dir) = driver(script.clone()).await;
        let opt = DeleteVolumeOpts {
            id: "v1".into(),
            metadata: Metadata::from([(KEY_LV_PATH.to_owned(), "/dev/vg0/volume-v1".to_owned())]),
        };
        driver.delete_volume(&Context::background(), &opt).await.unwrap();
        assert!(script.calls("lvremove").is_empty());
    }

    #[tokio::test]
    async fn delete_refuses_snapshot_origin() {
        let (driver, _dir) = driver(Script::new("  vg0 volume-v1 2.00 owi-a-s---\n")).await;
        let opt = DeleteVolumeOpts {
            id: "v1".into(),
            metadata: Metadata::from([(KEY_LV_PATH.to_owned(), "/dev/vg0/volume-v1".to_owned())]),
        };
        let err = driver.delete_volume(&Context::background(), &opt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[tokio::test]
    async fn pull_volume_reports_backend_size() {
        let (driver, _dir) = driver(Script::new("  vg0 volume-v1 3.00 -wi-a-----\n")).await;
        let spec = driver
            .pull_volume(&Context::background(), "v1", &Metadata::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spec.size, 3);
        assert_eq!(spec.pool_name, "vg0");
        assert!(
            driver
                .pull_volume(&Context::background(), "v2", &Metadata::new())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn pools_are_filtered_and_stable() {
        let (driver, _dir) = driver(Script::new("")).await;
        let pools = driver.list_pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].name, "vg0");
        assert_eq!(pools[0].total_capacity, 20);
        assert_eq!(pools[0].free_capacity, 8);
        assert_eq!(pools[0].id, pool_id("uuid-vg0"));
        assert_eq!(pools[0].availability_zone, "az-1");
    }

    #[tokio::test]
    async fn snapshot_uses_readonly_cow() {
        let script = Script::new("");
        let (driver, _dir) = driver(script.clone()).await;
        let opt = CreateSnapshotOpts {
            id: "s1".into(),
            volume_id: "v1".into(),
            size: 2,
            volume_metadata: Metadata::from([(KEY_LV_PATH.to_owned(), "/dev/vg0/volume-v1".to_owned())]),
            ..Default::default()
        };
        let snap = driver.create_snapshot(&Context::background(), &opt).await.unwrap();
        assert_eq!(snap.metadata[KEY_LVS_PATH], "/dev/vg0/_snapshot-s1");
        assert_eq!(
            script.calls("lvcreate"),
            vec!["lvcreate -n _snapshot-s1 -L 2g -p r -s vg0/volume-v1".to_owned()]
        );
        assert_eq!(
            driver.device_path(ResourceKind::Snapshot, &snap.metadata),
            Some(PathBuf::from("/dev/vg0/_snapshot-s1"))
        );
    }
}
