//! Host-side attach of an export.
//!
//! A [`Connector`] logs the local host into a target described by
//! [`ConnectionInfo`] and returns the block device that appears, so the dock
//! can stream a snapshot to an object store or restore a volume from one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::TargetError;
use crate::exec::Executor;
use crate::types::{ANY_HOST, ConnectionInfo};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEVICE_POLL_ATTEMPTS: u32 = 20;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Attach the export and return the local device path.
    async fn attach(&self, info: &ConnectionInfo) -> Result<PathBuf, TargetError>;

    /// Detach the export. Succeeds when it is not attached.
    async fn detach(&self, info: &ConnectionInfo) -> Result<(), TargetError>;
}

fn required<'a>(info: &'a ConnectionInfo, key: &str) -> Result<&'a str, TargetError> {
    info.str_field(key)
        .ok_or_else(|| TargetError::Invalid(format!("connection data lacks {key}")))
}

async fn wait_for<F, Fut>(what: &str, mut locate: F) -> Result<PathBuf, TargetError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<PathBuf>, TargetError>>,
{
    for _ in 0..DEVICE_POLL_ATTEMPTS {
        if let Some(path) = locate().await? {
            return Ok(path);
        }
        tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
    }
    Err(TargetError::NotFound(what.to_owned()))
}

// ---------------------------------------------------------------------------
// iSCSI
// ---------------------------------------------------------------------------

/// Open-iSCSI (`iscsiadm`) connector.
pub struct IscsiConnector {
    exec: Arc<dyn Executor>,
    by_path_root: PathBuf,
}

impl IscsiConnector {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self::with_device_root(exec, "/dev/disk/by-path")
    }

    pub fn with_device_root(exec: Arc<dyn Executor>, by_path_root: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            by_path_root: by_path_root.into(),
        }
    }

    fn device_path(&self, portal: &str, iqn: &str, lun: u64) -> PathBuf {
        self.by_path_root
            .join(format!("ip-{portal}-iscsi-{iqn}-lun-{lun}"))
    }

    async fn node(&self, portal: &str, iqn: &str, extra: &[&str]) -> Result<String, TargetError> {
        let mut args = vec!["-m", "node", "-p", portal, "-T", iqn];
        args.extend_from_slice(extra);
        self.exec.run("iscsiadm", &args).await
    }

    async fn logged_in(&self, iqn: &str) -> bool {
        // `iscsiadm -m session` exits non-zero when there are no sessions.
        match self.exec.run("iscsiadm", &["-m", "session"]).await {
            Ok(out) => out.lines().any(|l| l.split_whitespace().any(|f| f == iqn)),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Connector for IscsiConnector {
    #[instrument(skip(self, info))]
    async fn attach(&self, info: &ConnectionInfo) -> Result<PathBuf, TargetError> {
        let portal = required(info, "targetPortal")?;
        let iqn = required(info, "targetIQN")?;
        let lun = info
            .connection_data
            .get("targetLun")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);

        self.exec
            .run("iscsiadm", &["-m", "discovery", "-t", "sendtargets", "-p", portal])
            .await?;

        if info.str_field("authMethod") == Some("chap") {
            let user = required(info, "authUserName")?;
            let secret = required(info, "authPassword")?;
            for (name, value) in [
                ("node.session.auth.authmethod", "CHAP"),
                ("node.session.auth.username", user),
                ("node.session.auth.password", secret),
            ] {
                self.node(portal, iqn, &["--op", "update", "-n", name, "-v", value])
                    .await?;
            }
        }

        if !self.logged_in(iqn).await {
            self.node(portal, iqn, &["--login"]).await?;
        }

        let device = self.device_path(portal, iqn, lun);
        let path = wait_for(iqn, || {
            let device = device.clone();
            async move {
                let found = tokio::fs::try_exists(&device)
                    .await
                    .map_err(|e| TargetError::io(&device, e))?;
                Ok(found.then_some(device))
            }
        })
        .await?;
        info!(device = %path.display(), %iqn, "iscsi target attached");
        Ok(path)
    }

    #[instrument(skip(self, info))]
    async fn detach(&self, info: &ConnectionInfo) -> Result<(), TargetError> {
        let portal = required(info, "targetPortal")?;
        let iqn = required(info, "targetIQN")?;
        if !self.logged_in(iqn).await {
            debug!(%iqn, "no session, nothing to detach");
            return Ok(());
        }
        self.node(portal, iqn, &["--logout"]).await?;
        if let Err(e) = self.node(portal, iqn, &["-o", "delete"]).await {
            warn!(%iqn, error = %e, "failed to delete node record");
        }
        info!(%iqn, "iscsi target detached");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NVMe-oF
// ---------------------------------------------------------------------------

/// nvme-cli connector.
pub struct NvmeofConnector {
    exec: Arc<dyn Executor>,
    sysfs_root: PathBuf,
}

impl NvmeofConnector {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self::with_sysfs_root(exec, "/sys")
    }

    pub fn with_sysfs_root(exec: Arc<dyn Executor>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            sysfs_root: sysfs_root.into(),
        }
    }

    /// `/dev/nvmeXnY` of the first namespace of the subsystem named `nqn`.
    async fn find_namespace(&self, nqn: &str) -> Result<Option<PathBuf>, TargetError> {
        let class = self.sysfs_root.join("class/nvme-subsystem");
        let mut subsystems = match tokio::fs::read_dir(&class).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TargetError::io(&class, e)),
        };
        while let Some(entry) = subsystems
            .next_entry()
            .await
            .map_err(|e| TargetError::io(&class, e))?
        {
            let dir = entry.path();
            let Ok(subsysnqn) = tokio::fs::read_to_string(dir.join("subsysnqn")).await else {
                continue;
            };
            if subsysnqn.trim() != nqn {
                continue;
            }
            return first_namespace(&dir).await;
        }
        Ok(None)
    }
}

async fn first_namespace(dir: &Path) -> Result<Option<PathBuf>, TargetError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| TargetError::io(dir, e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TargetError::io(dir, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_namespace_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.first().map(|n| PathBuf::from("/dev").join(n)))
}

/// `nvme<ctrl>n<ns>`, without partition suffixes.
fn is_namespace_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    match rest.split_once('n') {
        Some((ctrl, ns)) => {
            !ctrl.is_empty()
                && !ns.is_empty()
                && ctrl.chars().all(|c| c.is_ascii_digit())
                && ns.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

#[async_trait]
impl Connector for NvmeofConnector {
    #[instrument(skip(self, info))]
    async fn attach(&self, info: &ConnectionInfo) -> Result<PathBuf, TargetError> {
        let nqn = required(info, "targetNQN")?;
        if let Some(path) = self.find_namespace(nqn).await? {
            return Ok(path);
        }
        let ip = required(info, "targetIP")?;
        let port = required(info, "targetPort")?;
        let transport = info.str_field("transportType").unwrap_or("tcp");
        let mut args = vec!["connect", "-t", transport, "-n", nqn, "-a", ip, "-s", port];
        if let Some(host_nqn) = info.str_field("hostNqn").filter(|h| *h != ANY_HOST) {
            args.extend_from_slice(&["-q", host_nqn]);
        }
        self.exec.run("nvme", &args).await?;

        let path = wait_for(nqn, || self.find_namespace(nqn)).await?;
        info!(device = %path.display(), %nqn, "nvmeof subsystem attached");
        Ok(path)
    }

    #[instrument(skip(self, info))]
    async fn detach(&self, info: &ConnectionInfo) -> Result<(), TargetError> {
        let nqn = required(info, "targetNQN")?;
        if self.find_namespace(nqn).await?.is_none() {
            debug!(%nqn, "not connected, nothing to detach");
            return Ok(());
        }
        self.exec.run("nvme", &["disconnect", "-n", nqn]).await?;
        info!(%nqn, "nvmeof subsystem detached");
        Ok(())
    }
}
