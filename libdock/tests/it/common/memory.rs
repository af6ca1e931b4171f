//! In-memory object store, export target, connector and drivers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use libdock::backup::{CompletedPart, ObjectStore};
use libdock::context::Context;
use libdock::driver::{Driver, Lifecycle, PoolDiscovery};
use libdock::model::*;
use libdock::opts::*;
use libdock::{BlockVolume, DockError, FileShare};
use libtarget::{Connector, ExportRequest, Target, TargetError};

// ---------------------------------------------------------------------------
// Object store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    uploads: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    next_upload: AtomicUsize,
    pub fail_complete: AtomicBool,
    pub aborted: AtomicUsize,
    pub removed: Mutex<Vec<String>>,
}

impl MemStore {
    pub fn put(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_owned(), key.to_owned()), data.to_vec());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn init_multipart(&self, _bucket: &str, _key: &str) -> Result<String, DockError> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String, DockError> {
        let mut uploads = self.uploads.lock().unwrap();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| DockError::NotFound(upload_id.to_owned()))?;
        parts.push(data.to_vec());
        Ok(format!("etag-{part_number}"))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), DockError> {
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(DockError::Backend("complete multipart rejected".into()));
        }
        let uploaded = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| DockError::NotFound(upload_id.to_owned()))?;
        assert_eq!(uploaded.len(), parts.len());
        self.put(bucket, key, &uploaded.concat());
        Ok(())
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<(), DockError> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download_part(&self, bucket: &str, key: &str, offset: u64, size: u64) -> Result<Vec<u8>, DockError> {
        let data = self
            .object(bucket, key)
            .ok_or_else(|| DockError::NotFound(format!("{bucket}/{key}")))?;
        let start = (offset as usize).min(data.len());
        let end = (start + size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> Result<(), DockError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_owned(), key.to_owned()));
        self.removed.lock().unwrap().push(format!("{bucket}/{key}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Export target and connector
// ---------------------------------------------------------------------------

/// Export target that only records what it was asked to publish.
#[derive(Default)]
pub struct RecordingTarget {
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl Target for RecordingTarget {
    fn protocol(&self) -> AccessProtocol {
        AccessProtocol::Iscsi
    }

    async fn create_export(&self, req: &ExportRequest) -> Result<ConnectionInfo, TargetError> {
        self.created.lock().unwrap().push(req.volume_id.clone());
        Ok(ConnectionInfo::new(AccessProtocol::Iscsi)
            .with("volumeId", req.volume_id.clone())
            .with("devicePath", req.device_path.display().to_string()))
    }

    async fn remove_export(&self, volume_id: &str, _host_ip: &str) -> Result<(), TargetError> {
        self.removed.lock().unwrap().push(volume_id.to_owned());
        Ok(())
    }
}

/// Connector that "attaches" the exported device path itself, or an
/// override file registered for the exported id.
pub struct FakeConnector {
    overrides: Mutex<HashMap<String, PathBuf>>,
    pub attached: Mutex<Vec<String>>,
    pub detached: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            overrides: Mutex::new(HashMap::new()),
            attached: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
        }
    }

    pub fn map_device(&self, id: &str, path: &Path) {
        self.overrides
            .lock()
            .unwrap()
            .insert(id.to_owned(), path.to_path_buf());
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn attach(&self, info: &ConnectionInfo) -> Result<PathBuf, TargetError> {
        let id = info.str_field("volumeId").unwrap_or_default().to_owned();
        self.attached.lock().unwrap().push(id.clone());
        if let Some(path) = self.overrides.lock().unwrap().get(&id) {
            return Ok(path.clone());
        }
        info.str_field("devicePath")
            .map(PathBuf::from)
            .ok_or_else(|| TargetError::Invalid("no device path".into()))
    }

    async fn detach(&self, info: &ConnectionInfo) -> Result<(), TargetError> {
        let id = info.str_field("volumeId").unwrap_or_default().to_owned();
        self.detached.lock().unwrap().push(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed block driver
// ---------------------------------------------------------------------------

pub const FILE_DRIVER: &str = "file";
pub const KEY_FILE: &str = "filePath";

/// Block driver keeping each volume and snapshot as a plain file, so the
/// dock's local copy and cloud restore paths have real devices to work on.
pub struct FileDriver {
    root: PathBuf,
    /// Report every volume as `creating`, forever.
    stuck: bool,
}

impl FileDriver {
    pub fn new(root: PathBuf, stuck: bool) -> Self {
        Self { root, stuck }
    }

    fn status(&self) -> Status {
        if self.stuck { Status::Creating } else { Status::Available }
    }
}

fn file_of(metadata: &Metadata) -> Result<PathBuf, DockError> {
    metadata
        .get(KEY_FILE)
        .map(PathBuf::from)
        .ok_or_else(|| DockError::Validation(format!("metadata has no {KEY_FILE}")))
}

async fn remove(path: &Path) -> Result<(), DockError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DockError::transport(e)),
    }
}

#[async_trait]
impl Lifecycle for FileDriver {
    async fn setup(&mut self, _config_path: Option<&Path>) -> Result<(), DockError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(DockError::config)
    }

    async fn unset(&self) -> Result<(), DockError> {
        Ok(())
    }
}

#[async_trait]
impl PoolDiscovery for FileDriver {
    async fn list_pools(&self) -> Result<Vec<PoolSpec>, DockError> {
        Ok(vec![PoolSpec {
            id: pool_id("files"),
            name: "files".into(),
            total_capacity: 4,
            free_capacity: 9,
            ..Default::default()
        }])
    }
}

impl Driver for FileDriver {
    fn name(&self) -> &'static str {
        FILE_DRIVER
    }

    fn as_block(&self) -> Option<&dyn BlockVolume> {
        Some(self)
    }

    fn vendor_id_keys(&self, kind: ResourceKind) -> &'static [&'static str] {
        match kind {
            ResourceKind::Volume | ResourceKind::Snapshot => &[KEY_FILE],
            _ => &[],
        }
    }
}

#[async_trait]
impl BlockVolume for FileDriver {
    async fn create_volume(&self, _ctx: &Context, opt: &CreateVolumeOpts) -> Result<VolumeSpec, DockError> {
        let path = self.root.join(format!("volume-{}", opt.id));
        if !path.exists() {
            tokio::fs::write(&path, b"").await.map_err(DockError::transport)?;
        }
        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_FILE.to_owned(), path.display().to_string());
        Ok(VolumeSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: format!("volume-{}", opt.id),
            size: opt.size,
            snapshot_id: opt.snapshot_id.clone(),
            status: self.status(),
            metadata,
            ..Default::default()
        })
    }

    async fn pull_volume(
        &self,
        _ctx: &Context,
        id: &str,
        metadata: &Metadata,
    ) -> Result<Option<VolumeSpec>, DockError> {
        let path = match metadata.get(KEY_FILE) {
            Some(path) => PathBuf::from(path),
            None => self.root.join(format!("volume-{id}")),
        };
        if !path.exists() {
            return Ok(None);
        }
        let mut metadata = metadata.clone();
        metadata.insert(KEY_FILE.to_owned(), path.display().to_string());
        Ok(Some(VolumeSpec {
            id: id.to_owned(),
            status: self.status(),
            metadata,
            ..Default::default()
        }))
    }

    async fn delete_volume(&self, _ctx: &Context, opt: &DeleteVolumeOpts) -> Result<(), DockError> {
        remove(&file_of(&opt.metadata)?).await
    }

    async fn extend_volume(&self, _ctx: &Context, opt: &ExtendVolumeOpts) -> Result<VolumeSpec, DockError> {
        Ok(VolumeSpec {
            id: opt.id.clone(),
            size: opt.size,
            metadata: opt.metadata.clone(),
            ..Default::default()
        })
    }

    async fn initialize_connection(
        &self,
        _ctx: &Context,
        _opt: &CreateAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError> {
        Err(DockError::NotImplemented("file volumes are not exported".into()))
    }

    async fn terminate_connection(&self, _ctx: &Context, _opt: &DeleteAttachmentOpts) -> Result<(), DockError> {
        Err(DockError::NotImplemented("file volumes are not exported".into()))
    }

    async fn create_snapshot(&self, _ctx: &Context, opt: &CreateSnapshotOpts) -> Result<SnapshotSpec, DockError> {
        let path = self.root.join(format!("snapshot-{}", opt.id));
        tokio::fs::copy(file_of(&opt.volume_metadata)?, &path)
            .await
            .map_err(DockError::transport)?;
        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_FILE.to_owned(), path.display().to_string());
        Ok(SnapshotSpec {
            id: opt.id.clone(),
            volume_id: opt.volume_id.clone(),
            size: opt.size,
            status: Status::Available,
            metadata,
            ..Default::default()
        })
    }

    async fn delete_snapshot(&self, _ctx: &Context, opt: &DeleteSnapshotOpts) -> Result<(), DockError> {
        remove(&file_of(&opt.metadata)?).await
    }

    async fn initialize_snapshot_connection(
        &self,
        _ctx: &Context,
        _opt: &CreateSnapshotAttachmentOpts,
    ) -> Result<ConnectionInfo, DockError> {
        Err(DockError::NotImplemented("file snapshots are not exported".into()))
    }

    async fn terminate_snapshot_connection(
        &self,
        _ctx: &Context,
        _opt: &DeleteSnapshotAttachmentOpts,
    ) -> Result<(), DockError> {
        Err(DockError::NotImplemented("file snapshots are not exported".into()))
    }

    fn device_path(&self, kind: ResourceKind, metadata: &Metadata) -> Option<PathBuf> {
        match kind {
            ResourceKind::Volume | ResourceKind::Snapshot => metadata.get(KEY_FILE).map(PathBuf::from),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory file share driver
// ---------------------------------------------------------------------------

pub const MEM_SHARES: &str = "memshare";
pub const KEY_SHARE: &str = "mem.shareId";
pub const KEY_ACCESS: &str = "mem.accessId";
pub const KEY_SHARE_SNAPSHOT: &str = "mem.snapshotId";

#[derive(Default)]
struct Shares {
    shares: HashMap<String, FileShareSpec>,
    /// acl id → (share id, access_to)
    acls: HashMap<String, (String, String)>,
    /// snapshot id → share id
    snapshots: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemShares {
    state: Mutex<Shares>,
}

impl MemShares {
    fn share_of(&self, metadata: &Metadata) -> Result<String, DockError> {
        let id = metadata
            .get(KEY_SHARE)
            .cloned()
            .ok_or_else(|| DockError::Validation(format!("metadata has no {KEY_SHARE}")))?;
        if !self.state.lock().unwrap().shares.contains_key(&id) {
            return Err(DockError::NotFound(format!("share {id}")));
        }
        Ok(id)
    }
}

#[async_trait]
impl Lifecycle for MemShares {
    async fn setup(&mut self, _config_path: Option<&Path>) -> Result<(), DockError> {
        Ok(())
    }

    async fn unset(&self) -> Result<(), DockError> {
        Ok(())
    }
}

#[async_trait]
impl PoolDiscovery for MemShares {
    async fn list_pools(&self) -> Result<Vec<PoolSpec>, DockError> {
        Ok(vec![PoolSpec {
            id: pool_id("pool1"),
            name: "pool1".into(),
            total_capacity: 100,
            free_capacity: 100,
            storage_type: StorageType::File,
            availability_zone: String::new(),
            ..Default::default()
        }])
    }
}

impl Driver for MemShares {
    fn name(&self) -> &'static str {
        MEM_SHARES
    }

    fn as_file_share(&self) -> Option<&dyn FileShare> {
        Some(self)
    }

    fn vendor_id_keys(&self, kind: ResourceKind) -> &'static [&'static str] {
        match kind {
            ResourceKind::FileShare => &[KEY_SHARE],
            ResourceKind::FileShareSnapshot => &[KEY_SHARE_SNAPSHOT],
            _ => &[],
        }
    }
}

#[async_trait]
impl FileShare for MemShares {
    async fn create_file_share(&self, _ctx: &Context, opt: &CreateFileShareOpts) -> Result<FileShareSpec, DockError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.shares.get(&opt.id) {
            return Ok(existing.clone());
        }
        let internal = format!("share_{}", opt.id.replace('-', "_"));
        let export_locations = opt
            .protocols
            .iter()
            .map(|p| match p {
                ShareProtocol::Nfs => format!("127.0.0.1:/{internal}"),
                ShareProtocol::Cifs => format!("\\\\127.0.0.1\\{internal}"),
            })
            .collect();
        let mut metadata = opt.metadata.clone();
        metadata.insert(KEY_SHARE.to_owned(), opt.id.clone());
        let share = FileShareSpec {
            id: opt.id.clone(),
            name: opt.name.clone(),
            internal_name: internal,
            size: opt.size,
            protocols: opt.protocols.clone(),
            pool_name: opt.pool_name.clone(),
            export_locations,
            status: Status::Available,
            metadata,
            ..Default::default()
        };
        state.shares.insert(opt.id.clone(), share.clone());
        Ok(share)
    }

    async fn delete_file_share(&self, _ctx: &Context, opt: &DeleteFileShareOpts) -> Result<(), DockError> {
        let mut state = self.state.lock().unwrap();
        let busy = state.acls.values().any(|(share, _)| *share == opt.id)
            || state.snapshots.values().any(|share| *share == opt.id);
        if busy {
            return Err(DockError::Backend(format!(
                "share {} still has acls or snapshots",
                opt.id
            )));
        }
        state.shares.remove(&opt.id);
        Ok(())
    }

    async fn create_file_share_acl(
        &self,
        _ctx: &Context,
        opt: &CreateFileShareAclOpts,
    ) -> Result<FileShareAclSpec, DockError> {
        let share = self.share_of(&opt.share_metadata)?;
        self.state
            .lock()
            .unwrap()
            .acls
            .insert(opt.id.clone(), (share, opt.access_to.clone()));
        Ok(FileShareAclSpec {
            id: opt.id.clone(),
            share_id: opt.share_id.clone(),
            access_type: opt.access_type,
            access_to: opt.access_to.clone(),
            access_capability: opt.access_capability.clone(),
            access_level: opt.access_level,
            metadata: Metadata::from([(KEY_ACCESS.to_owned(), opt.id.clone())]),
        })
    }

    async fn delete_file_share_acl(&self, _ctx: &Context, opt: &DeleteFileShareAclOpts) -> Result<(), DockError> {
        self.state.lock().unwrap().acls.remove(&opt.id);
        Ok(())
    }

    async fn create_file_share_snapshot(
        &self,
        _ctx: &Context,
        opt: &CreateFileShareSnapshotOpts,
    ) -> Result<FileShareSnapshotSpec, DockError> {
        let share = self.share_of(&opt.share_metadata)?;
        self.state
            .lock()
            .unwrap()
            .snapshots
            .insert(opt.id.clone(), share);
        Ok(FileShareSnapshotSpec {
            id: opt.id.clone(),
            share_id: opt.share_id.clone(),
            name: opt.name.clone(),
            size: opt.size,
            status: Status::Available,
            metadata: Metadata::from([(KEY_SHARE_SNAPSHOT.to_owned(), opt.id.clone())]),
            ..Default::default()
        })
    }

    async fn delete_file_share_snapshot(
        &self,
        _ctx: &Context,
        opt: &DeleteFileShareSnapshotOpts,
    ) -> Result<(), DockError> {
        self.state.lock().unwrap().snapshots.remove(&opt.id);
        Ok(())
    }
}
