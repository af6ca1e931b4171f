//! Dock dispatcher.
//!
//! Every operation runs the same pipeline:
//!
//! 1. validate the [`OpRequest`] into typed driver options,
//! 2. resolve the backend's driver (created and set up once, lazily),
//! 3. take the per-resource lock `(backend, kind, id)`,
//! 4. invoke the driver and any second phase (local copy, cloud restore,
//!    snapshot upload),
//! 5. prefix any error with operation, resource id and backend.
//!
//! The second phases move bytes through a local export ([`Exporter`]) and a
//! host connector ([`Connector`]) into the configured backup driver.

mod request;

pub use request::{OpRequest, profile_protocol, require_keys};

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use libtarget::{ANY_HOST, Connector, ExportKind, ExportRequest, Exporter, IscsiConnector, NvmeofConnector, ShellExecutor};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::backup::{BackupDriver, BackupSpec};
use crate::block::BlockVolume;
use crate::config::DockConfig;
use crate::context::Context;
use crate::driver::Driver;
use crate::error::DockError;
use crate::fileshare::FileShare;
use crate::lock::{LockKey, LockTable, ResourceGuard};
use crate::metric::Metric;
use crate::model::*;
use crate::opts::{DeleteSnapshotOpts, DeleteVolumeOpts};
use crate::registry::{BackupRegistry, DriverRegistry};
use crate::utils::wait_for;

/// Block size of the local snapshot → volume copy.
pub const COPY_BLOCK_SIZE: usize = 4096;

type Shared<T> = Arc<OnceCell<T>>;

pub struct Dock {
    config: DockConfig,
    drivers: Arc<DriverRegistry>,
    backups: Arc<BackupRegistry>,
    instances: DashMap<String, Shared<Arc<dyn Driver>>>,
    metrics_ready: DashMap<String, Shared<()>>,
    backup: OnceCell<Arc<dyn BackupDriver>>,
    locks: LockTable,
    exporter: Exporter,
    iscsi: Arc<dyn Connector>,
    nvmeof: Arc<dyn Connector>,
}

fn block(driver: &dyn Driver) -> Result<&dyn BlockVolume, DockError> {
    driver
        .as_block()
        .ok_or_else(|| DockError::NotImplemented(format!("{} has no block capability", driver.name())))
}

fn file_share(driver: &dyn Driver) -> Result<&dyn FileShare, DockError> {
    driver
        .as_file_share()
        .ok_or_else(|| DockError::NotImplemented(format!("{} has no file share capability", driver.name())))
}

fn metric(driver: &dyn Driver) -> Result<&dyn Metric, DockError> {
    driver
        .as_metric()
        .ok_or_else(|| DockError::NotImplemented(format!("{} has no metric capability", driver.name())))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DockError + '_ {
    move |e| DockError::Transport(format!("{}: {e}", path.display()))
}

impl Dock {
    /// Dock over the given registries, exporting and attaching with the
    /// local `tgt`, nvmet, `iscsiadm` and `nvme` tooling.
    pub fn new(config: DockConfig, drivers: Arc<DriverRegistry>, backups: Arc<BackupRegistry>) -> Self {
        let exec = Arc::new(ShellExecutor);
        Self {
            exporter: Exporter::new(&config.exporter, exec.clone()),
            iscsi: Arc::new(IscsiConnector::new(exec.clone())),
            nvmeof: Arc::new(NvmeofConnector::new(exec)),
            config,
            drivers,
            backups,
            instances: DashMap::new(),
            metrics_ready: DashMap::new(),
            backup: OnceCell::new(),
            locks: LockTable::new(),
        }
    }

    pub fn with_exporter(mut self, exporter: Exporter) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_connectors(mut self, iscsi: Arc<dyn Connector>, nvmeof: Arc<dyn Connector>) -> Self {
        self.iscsi = iscsi;
        self.nvmeof = nvmeof;
        self
    }

    pub fn config(&self) -> &DockConfig {
        &self.config
    }

    /// Backend types the dock can dispatch to.
    pub fn backends(&self) -> Vec<String> {
        self.drivers.names()
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// The set-up driver of `backend`. Concurrent first callers share a
    /// single setup; a failed setup is retried by the next caller.
    async fn driver(&self, backend: &str) -> Result<Arc<dyn Driver>, DockError> {
        let cell = self.instances.entry(backend.to_owned()).or_default().clone();
        let driver = cell
            .get_or_try_init(|| async {
                let mut driver = self.drivers.create(backend)?;
                driver.setup(self.config.driver_config(backend)).await?;
                info!(%backend, kinds = ?driver.kinds(), "driver set up");
                Ok::<_, DockError>(Arc::from(driver))
            })
            .await?;
        Ok(driver.clone())
    }

    async fn backup_driver(&self) -> Result<Arc<dyn BackupDriver>, DockError> {
        let driver = self
            .backup
            .get_or_try_init(|| async {
                let name = &self.config.backup_driver;
                let mut driver = self.backups.create(name)?;
                driver.setup(self.config.backup_config.as_deref()).await?;
                info!(backup_driver = %name, "backup driver set up");
                Ok::<_, DockError>(Arc::from(driver))
            })
            .await?;
        Ok(driver.clone())
    }

    /// Take the per-resource lock, giving up when `ctx` is canceled while
    /// queued behind another holder.
    async fn lock(&self, ctx: &Context, backend: &str, kind: ResourceKind, id: &str) -> Result<ResourceGuard, DockError> {
        tokio::select! {
            biased;
            _ = ctx.canceled() => Err(DockError::Canceled(format!("waiting for {kind} {id}"))),
            guard = self.locks.acquire(LockKey::new(backend, kind, id)) => Ok(guard),
        }
    }

    fn connector(&self, info: &ConnectionInfo) -> Result<&dyn Connector, DockError> {
        match info.protocol()? {
            AccessProtocol::Iscsi => Ok(self.iscsi.as_ref()),
            AccessProtocol::Nvmeof => Ok(self.nvmeof.as_ref()),
            other => Err(DockError::Validation(format!("no host connector for {other}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Volumes
    // -----------------------------------------------------------------------

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.id))]
    pub async fn create_volume(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<VolumeSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.create_volume_opts()?;
            let driver = self.driver(backend).await?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::Volume, &opt.id).await?;

            // A volume left by an earlier call already holds its data and
            // belongs to that caller; it is neither refilled nor rolled back.
            let existed = opt.snapshot_id.is_some() && self.volume_exists(ctx, block, &opt.id, &opt.metadata).await;

            let mut volume = block.create_volume(ctx, &opt).await?;
            if volume.status == Status::Creating {
                volume = self.wait_created(ctx, block, volume).await?;
            }

            if opt.snapshot_id.is_some() && !existed {
                let filled = self
                    .fill_from_snapshot(ctx, block, &volume, &opt.snapshot_metadata, opt.snapshot_from_cloud)
                    .await;
                if let Err(e) = filled {
                    let rollback = DeleteVolumeOpts {
                        id: volume.id.clone(),
                        metadata: volume.metadata.clone(),
                    };
                    if let Err(re) = block.delete_volume(ctx, &rollback).await {
                        warn!(error = %re, "rollback of volume failed");
                    }
                    return Err(e);
                }
            }
            info!(%backend, size = volume.size, "volume created");
            Ok(volume)
        }
        .await;
        res.map_err(|e| e.context("create_volume", &req.id, backend))
    }

    async fn volume_exists(&self, ctx: &Context, block: &dyn BlockVolume, id: &str, metadata: &Metadata) -> bool {
        match block.pull_volume(ctx, id, metadata).await {
            Ok(Some(volume)) => volume.status != Status::Error,
            Ok(None) => false,
            Err(e) => {
                debug!(volume_id = %id, error = %e, "existence check failed, treating volume as new");
                false
            }
        }
    }

    /// Poll the backend until the volume leaves `creating`.
    async fn wait_created(&self, ctx: &Context, block: &dyn BlockVolume, volume: VolumeSpec) -> Result<VolumeSpec, DockError> {
        let latest = parking_lot::Mutex::new(None::<VolumeSpec>);
        {
            let (id, metadata, latest) = (&volume.id, &volume.metadata, &latest);
            wait_for(
                ctx,
                &format!("volume {id} to leave creating"),
                self.config.wait.interval(),
                self.config.wait.timeout(),
                move || async move {
                    let Some(pulled) = block.pull_volume(ctx, id, metadata).await? else {
                        return Ok(false);
                    };
                    let done = pulled.status != Status::Creating;
                    *latest.lock() = Some(pulled);
                    Ok(done)
                },
            )
            .await?;
        }
        let pulled = latest.into_inner().unwrap_or_default();
        let mut volume = volume;
        volume.status = pulled.status;
        volume.metadata.extend(pulled.metadata);
        if volume.status == Status::Error {
            return Err(DockError::Backend(format!("volume {} went to error", volume.id)));
        }
        Ok(volume)
    }

    /// Second phase of create-from-snapshot. Drivers that copy on the array
    /// expose no local devices and are left alone.
    async fn fill_from_snapshot(
        &self,
        ctx: &Context,
        block: &dyn BlockVolume,
        volume: &VolumeSpec,
        snapshot_metadata: &Metadata,
        from_cloud: bool,
    ) -> Result<(), DockError> {
        if from_cloud {
            return self.restore_from_cloud(ctx, block, volume, snapshot_metadata).await;
        }
        let source = block.device_path(ResourceKind::Snapshot, snapshot_metadata);
        let target = block.device_path(ResourceKind::Volume, &volume.metadata);
        match (source, target) {
            (Some(source), Some(target)) => copy_device(ctx, &source, &target).await,
            _ => {
                debug!(volume_id = %volume.id, "snapshot data copied by the backend");
                Ok(())
            }
        }
    }

    async fn restore_from_cloud(
        &self,
        ctx: &Context,
        block: &dyn BlockVolume,
        volume: &VolumeSpec,
        snapshot_metadata: &Metadata,
    ) -> Result<(), DockError> {
        require_keys(snapshot_metadata, &[KEY_BACKUP_ID, KEY_BUCKET], "snapshot")?;
        let device = block
            .device_path(ResourceKind::Volume, &volume.metadata)
            .ok_or_else(|| DockError::NotImplemented("cloud restore needs a local volume device".into()))?;
        let backup = self.backup_driver().await?;
        let spec = BackupSpec::new(volume.id.clone(), &snapshot_metadata[KEY_BUCKET]);
        let backup_id = &snapshot_metadata[KEY_BACKUP_ID];
        self.with_attached(ExportKind::Volume, &volume.id, &device, |path| async move {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(io_err(&path))?;
            backup.restore(ctx, &spec, backup_id, &mut file).await?;
            file.flush().await.map_err(io_err(&path))?;
            info!(%backup_id, "volume restored from cloud");
            Ok(())
        })
        .await
    }

    /// Export `device` locally, attach it, run `op` on the attached path,
    /// then detach and remove the export whatever `op` returned.
    async fn with_attached<F, Fut>(&self, kind: ExportKind, id: &str, device: &Path, op: F) -> Result<(), DockError>
    where
        F: FnOnce(std::path::PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<(), DockError>>,
    {
        let info = self
            .exporter
            .create_export(kind, AccessProtocol::Iscsi, ExportRequest::new(id, device))
            .await?;
        let res: Result<_, DockError> = async {
            let connector = self.connector(&info)?;
            let path = connector.attach(&info).await?;
            let res = op(path).await;
            if let Err(e) = connector.detach(&info).await {
                warn!(%id, error = %e, "detach failed");
            }
            res
        }
        .await;
        if let Err(e) = self.exporter.remove_export(id, ANY_HOST).await {
            warn!(%id, error = %e, "export removal failed");
        }
        res
    }

    /// Current backend view of a volume; [`DockError::NotFound`] when the
    /// backend has no record.
    #[instrument(skip(self, ctx, req), fields(volume_id = %req.id))]
    pub async fn pull_volume(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<VolumeSpec, DockError> {
        let res: Result<_, DockError> = async {
            let driver = self.driver(backend).await?;
            let _guard = self.lock(ctx, backend, ResourceKind::Volume, &req.id).await?;
            block(driver.as_ref())?
                .pull_volume(ctx, &req.id, &req.metadata)
                .await?
                .ok_or_else(|| DockError::NotFound(format!("volume {}", req.id)))
        }
        .await;
        res.map_err(|e| e.context("pull_volume", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.id))]
    pub async fn delete_volume(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.delete_volume_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.metadata, driver.vendor_id_keys(ResourceKind::Volume), "volume")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::Volume, &opt.id).await?;
            block.delete_volume(ctx, &opt).await?;
            info!(%backend, "volume deleted");
            Ok(())
        }
        .await;
        res.map_err(|e| e.context("delete_volume", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(volume_id = %req.id, size = req.size))]
    pub async fn extend_volume(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<VolumeSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.extend_volume_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.metadata, driver.vendor_id_keys(ResourceKind::Volume), "volume")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::Volume, &opt.id).await?;
            block.extend_volume(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("extend_volume", &req.id, backend))
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    #[instrument(skip(self, ctx, req), fields(attachment_id = %req.id, volume_id = %req.volume_id))]
    pub async fn create_attachment(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<AttachmentSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.create_attachment_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.volume_metadata, driver.vendor_id_keys(ResourceKind::Volume), "volume")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::Attachment, &opt.id).await?;
            let connection_info = block.initialize_connection(ctx, &opt).await?;
            info!(%backend, protocol = %connection_info.driver_volume_type, "volume attached");
            Ok(AttachmentSpec {
                id: opt.id,
                volume_id: opt.volume_id,
                host_info: opt.host_info,
                access_protocol: opt.access_protocol,
                connection_info,
                status: Status::Available,
            })
        }
        .await;
        res.map_err(|e| e.context("create_attachment", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(attachment_id = %req.id, volume_id = %req.volume_id))]
    pub async fn delete_attachment(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.delete_attachment_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.volume_metadata, driver.vendor_id_keys(ResourceKind::Volume), "volume")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::Attachment, &opt.id).await?;
            block.terminate_connection(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("delete_attachment", &req.id, backend))
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Take a snapshot and, when the request metadata names a `bucket`,
    /// upload it. A failed upload deletes the local snapshot.
    #[instrument(skip(self, ctx, req), fields(snapshot_id = %req.id, volume_id = %req.volume_id))]
    pub async fn create_snapshot(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<SnapshotSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.create_snapshot_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.volume_metadata, driver.vendor_id_keys(ResourceKind::Volume), "volume")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::Snapshot, &opt.id).await?;

            let mut snapshot = block.create_snapshot(ctx, &opt).await?;
            if let Some(bucket) = opt.metadata.get(KEY_BUCKET) {
                match self.upload_snapshot(ctx, block, &snapshot, bucket).await {
                    Ok(backup_id) => {
                        snapshot.metadata.insert(KEY_BACKUP_ID.to_owned(), backup_id);
                        snapshot.metadata.insert(KEY_BUCKET.to_owned(), bucket.clone());
                    }
                    Err(e) => {
                        let rollback = DeleteSnapshotOpts {
                            id: snapshot.id.clone(),
                            volume_id: snapshot.volume_id.clone(),
                            metadata: snapshot.metadata.clone(),
                        };
                        if let Err(re) = block.delete_snapshot(ctx, &rollback).await {
                            warn!(error = %re, "rollback of snapshot failed");
                        }
                        return Err(e);
                    }
                }
            }
            info!(%backend, "snapshot created");
            Ok(snapshot)
        }
        .await;
        res.map_err(|e| e.context("create_snapshot", &req.id, backend))
    }

    async fn upload_snapshot(
        &self,
        ctx: &Context,
        block: &dyn BlockVolume,
        snapshot: &SnapshotSpec,
        bucket: &str,
    ) -> Result<String, DockError> {
        let device = block
            .device_path(ResourceKind::Snapshot, &snapshot.metadata)
            .ok_or_else(|| DockError::NotImplemented("snapshot upload needs a local snapshot device".into()))?;
        let backup = self.backup_driver().await?;
        let spec = BackupSpec::new(snapshot.id.clone(), bucket);
        let backup_id = parking_lot::Mutex::new(String::new());
        let (spec, slot) = (&spec, &backup_id);
        self.with_attached(ExportKind::Snapshot, &snapshot.id, &device, |path| async move {
            let mut file = File::open(&path).await.map_err(io_err(&path))?;
            let id = backup.backup(ctx, spec, &mut file).await?;
            info!(backup_id = %id, %bucket, "snapshot uploaded");
            *slot.lock() = id;
            Ok(())
        })
        .await?;
        Ok(backup_id.into_inner())
    }

    /// Delete a snapshot and the remote backup it carries, if any.
    #[instrument(skip(self, ctx, req), fields(snapshot_id = %req.id))]
    pub async fn delete_snapshot(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.delete_snapshot_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.metadata, driver.vendor_id_keys(ResourceKind::Snapshot), "snapshot")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::Snapshot, &opt.id).await?;
            block.delete_snapshot(ctx, &opt).await?;

            let remote = (opt.metadata.get(KEY_BACKUP_ID), opt.metadata.get(KEY_BUCKET));
            if let (Some(backup_id), Some(bucket)) = remote {
                let spec = BackupSpec::new(backup_id.clone(), bucket.clone());
                match self.backup_driver().await?.delete(ctx, &spec).await {
                    Ok(()) => info!(%backup_id, %bucket, "remote backup deleted"),
                    Err(e) if e.is_not_found() => debug!(%backup_id, "remote backup already gone"),
                    Err(e) => return Err(e),
                }
            }
            info!(%backend, "snapshot deleted");
            Ok(())
        }
        .await;
        res.map_err(|e| e.context("delete_snapshot", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(attachment_id = %req.id))]
    pub async fn create_snapshot_attachment(
        &self,
        ctx: &Context,
        backend: &str,
        req: &OpRequest,
    ) -> Result<AttachmentSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.create_snapshot_attachment_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.snapshot_metadata, driver.vendor_id_keys(ResourceKind::Snapshot), "snapshot")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::SnapshotAttachment, &opt.id).await?;
            let connection_info = block.initialize_snapshot_connection(ctx, &opt).await?;
            Ok(AttachmentSpec {
                id: opt.id,
                volume_id: opt.snapshot_id,
                host_info: opt.host_info,
                access_protocol: opt.access_protocol,
                connection_info,
                status: Status::Available,
            })
        }
        .await;
        res.map_err(|e| e.context("create_snapshot_attachment", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(attachment_id = %req.id))]
    pub async fn delete_snapshot_attachment(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.delete_snapshot_attachment_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.snapshot_metadata, driver.vendor_id_keys(ResourceKind::Snapshot), "snapshot")?;
            let block = block(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::SnapshotAttachment, &opt.id).await?;
            block.terminate_snapshot_connection(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("delete_snapshot_attachment", &req.id, backend))
    }

    // -----------------------------------------------------------------------
    // Volume groups
    // -----------------------------------------------------------------------

    #[instrument(skip(self, ctx, req), fields(group_id = %req.id))]
    pub async fn create_volume_group(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<VolumeGroupSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.volume_group_opts()?;
            let driver = self.driver(backend).await?;
            let _guard = self.lock(ctx, backend, ResourceKind::VolumeGroup, &opt.id).await?;
            block(driver.as_ref())?.create_volume_group(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("create_volume_group", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(group_id = %req.id))]
    pub async fn update_volume_group(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<VolumeGroupSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.volume_group_opts()?;
            let driver = self.driver(backend).await?;
            let _guard = self.lock(ctx, backend, ResourceKind::VolumeGroup, &opt.id).await?;
            block(driver.as_ref())?.update_volume_group(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("update_volume_group", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(group_id = %req.id))]
    pub async fn delete_volume_group(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.volume_group_opts()?;
            let driver = self.driver(backend).await?;
            let _guard = self.lock(ctx, backend, ResourceKind::VolumeGroup, &opt.id).await?;
            block(driver.as_ref())?.delete_volume_group(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("delete_volume_group", &req.id, backend))
    }

    // -----------------------------------------------------------------------
    // File shares
    // -----------------------------------------------------------------------

    #[instrument(skip(self, ctx, req), fields(share_id = %req.id))]
    pub async fn create_file_share(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<FileShareSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.create_file_share_opts()?;
            let driver = self.driver(backend).await?;
            let shares = file_share(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::FileShare, &opt.id).await?;
            let share = shares.create_file_share(ctx, &opt).await?;
            if share.export_locations.is_empty() {
                return Err(DockError::Backend(format!("share {} has no export location", opt.id)));
            }
            info!(%backend, locations = ?share.export_locations, "file share created");
            Ok(share)
        }
        .await;
        res.map_err(|e| e.context("create_file_share", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(share_id = %req.id))]
    pub async fn delete_file_share(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.delete_file_share_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.metadata, driver.vendor_id_keys(ResourceKind::FileShare), "file share")?;
            let shares = file_share(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::FileShare, &opt.id).await?;
            shares.delete_file_share(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("delete_file_share", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(acl_id = %req.id, share_id = %req.share_id))]
    pub async fn create_file_share_acl(
        &self,
        ctx: &Context,
        backend: &str,
        req: &OpRequest,
    ) -> Result<FileShareAclSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.create_file_share_acl_opts()?;
            let driver = self.driver(backend).await?;
            let shares = file_share(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::FileShareAcl, &opt.id).await?;
            shares.create_file_share_acl(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("create_file_share_acl", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(acl_id = %req.id, share_id = %req.share_id))]
    pub async fn delete_file_share_acl(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.delete_file_share_acl_opts()?;
            let driver = self.driver(backend).await?;
            let shares = file_share(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::FileShareAcl, &opt.id).await?;
            shares.delete_file_share_acl(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("delete_file_share_acl", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(snapshot_id = %req.id, share_id = %req.share_id))]
    pub async fn create_file_share_snapshot(
        &self,
        ctx: &Context,
        backend: &str,
        req: &OpRequest,
    ) -> Result<FileShareSnapshotSpec, DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.create_file_share_snapshot_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(&opt.share_metadata, driver.vendor_id_keys(ResourceKind::FileShare), "file share")?;
            let shares = file_share(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::FileShareSnapshot, &opt.id).await?;
            shares.create_file_share_snapshot(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("create_file_share_snapshot", &req.id, backend))
    }

    #[instrument(skip(self, ctx, req), fields(snapshot_id = %req.id))]
    pub async fn delete_file_share_snapshot(&self, ctx: &Context, backend: &str, req: &OpRequest) -> Result<(), DockError> {
        let res: Result<_, DockError> = async {
            let opt = req.delete_file_share_snapshot_opts()?;
            let driver = self.driver(backend).await?;
            require_keys(
                &opt.metadata,
                driver.vendor_id_keys(ResourceKind::FileShareSnapshot),
                "file share snapshot",
            )?;
            let shares = file_share(driver.as_ref())?;
            let _guard = self.lock(ctx, backend, ResourceKind::FileShareSnapshot, &opt.id).await?;
            shares.delete_file_share_snapshot(ctx, &opt).await
        }
        .await;
        res.map_err(|e| e.context("delete_file_share_snapshot", &req.id, backend))
    }

    // -----------------------------------------------------------------------
    // Pools and metrics
    // -----------------------------------------------------------------------

    /// Pools of `backend`, with free capacity clamped to total and empty
    /// availability zones defaulted.
    #[instrument(skip(self))]
    pub async fn list_pools(&self, backend: &str) -> Result<Vec<PoolSpec>, DockError> {
        let res: Result<_, DockError> = async {
            let mut pools = self.driver(backend).await?.list_pools().await?;
            for pool in &mut pools {
                if pool.free_capacity > pool.total_capacity {
                    warn!(pool = %pool.name, free = pool.free_capacity, total = pool.total_capacity, "free capacity above total, clamping");
                    pool.free_capacity = pool.total_capacity;
                }
                if pool.availability_zone.is_empty() {
                    pool.availability_zone = DEFAULT_AVAILABILITY_ZONE.to_owned();
                }
            }
            Ok(pools)
        }
        .await;
        res.map_err(|e| e.context("list_pools", "-", backend))
    }

    async fn metric_driver(&self, backend: &str) -> Result<Arc<dyn Driver>, DockError> {
        let driver = self.driver(backend).await?;
        let metrics = metric(driver.as_ref())?;
        let cell = self.metrics_ready.entry(backend.to_owned()).or_default().clone();
        cell.get_or_try_init(|| async {
            metrics.setup_metrics().await?;
            debug!(%backend, "metrics set up");
            Ok::<_, DockError>(())
        })
        .await?;
        Ok(driver)
    }

    pub async fn get_metric_list(&self, backend: &str, resource_type: &str) -> Result<Vec<MetricName>, DockError> {
        let res: Result<_, DockError> = async {
            let driver = self.metric_driver(backend).await?;
            metric(driver.as_ref())?.get_metric_list(resource_type).await
        }
        .await;
        res.map_err(|e| e.context("get_metric_list", resource_type, backend))
    }

    /// One sample of every metric `backend` supports. Safe to call
    /// concurrently.
    #[instrument(skip(self))]
    pub async fn collect_metrics(&self, backend: &str) -> Result<Vec<MetricSpec>, DockError> {
        let res: Result<_, DockError> = async {
            let driver = self.metric_driver(backend).await?;
            metric(driver.as_ref())?.collect_metrics().await
        }
        .await;
        res.map_err(|e| e.context("collect_metrics", "-", backend))
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Tear down metrics, unset every driver that was set up and clean up the
    /// backup driver. Errors are logged; the first one is returned.
    pub async fn shutdown(&self) -> Result<(), DockError> {
        let mut first = None;
        let instances: Vec<(String, Arc<dyn Driver>)> = self
            .instances
            .iter()
            .filter_map(|e| e.value().get().map(|d| (e.key().clone(), d.clone())))
            .collect();
        for (backend, driver) in instances {
            let metrics_on = self
                .metrics_ready
                .get(&backend)
                .is_some_and(|c| c.initialized());
            if let Some(m) = driver.as_metric().filter(|_| metrics_on) {
                if let Err(e) = m.teardown_metrics().await {
                    warn!(%backend, error = %e, "metric teardown failed");
                    first.get_or_insert(e);
                }
            }
            match driver.unset().await {
                Ok(()) => info!(%backend, "driver unset"),
                Err(e) => {
                    warn!(%backend, error = %e, "driver unset failed");
                    first.get_or_insert(e);
                }
            }
        }
        if let Some(backup) = self.backup.get() {
            if let Err(e) = backup.clean_up().await {
                warn!(error = %e, "backup driver clean up failed");
                first.get_or_insert(e);
            }
        }
        self.instances.clear();
        self.metrics_ready.clear();
        first.map_or(Ok(()), Err)
    }
}

/// Copy `source` onto `target` in [`COPY_BLOCK_SIZE`] blocks.
async fn copy_device(ctx: &Context, source: &Path, target: &Path) -> Result<(), DockError> {
    let mut src = File::open(source).await.map_err(io_err(source))?;
    let mut dst = OpenOptions::new()
        .write(true)
        .open(target)
        .await
        .map_err(io_err(target))?;
    let mut buf = vec![0u8; COPY_BLOCK_SIZE];
    let mut copied = 0u64;
    loop {
        if ctx.is_canceled() {
            return Err(DockError::Canceled(format!("copy {}", source.display())));
        }
        let n = src.read(&mut buf).await.map_err(io_err(source))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).await.map_err(io_err(target))?;
        copied += n as u64;
    }
    dst.flush().await.map_err(io_err(target))?;
    debug!(source = %source.display(), target = %target.display(), bytes = copied, "device copied");
    Ok(())
}
