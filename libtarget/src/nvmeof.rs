//! NVMe-oF targets through the kernel `nvmet` configfs tree.
//!
//! ```text
//! <root>/subsystems/<nqn>/attr_allow_any_host
//! <root>/subsystems/<nqn>/allowed_hosts/<host-nqn> -> <root>/hosts/<host-nqn>
//! <root>/subsystems/<nqn>/namespaces/1/{device_path,enable}
//! <root>/ports/1/{addr_traddr,addr_trtype,addr_trsvcid,addr_adrfam}
//! <root>/ports/1/subsystems/<nqn> -> <root>/subsystems/<nqn>
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::error::TargetError;
use crate::exec::Executor;
use crate::exporter::Target;
use crate::types::{ANY_HOST, AccessProtocol, ConnectionInfo, ExportRequest};

pub const NQN_PREFIX: &str = "nqn.2019-01.io.opensds:";
pub const DEFAULT_NVMET_ROOT: &str = "/sys/kernel/config/nvmet";
pub const NVMEOF_PORT: u16 = 4420;
const NAMESPACE_ID: &str = "1";
const PORT_ID: &str = "1";

/// NVMe-oF exporter writing nvmet configfs nodes.
pub struct NvmetTarget {
    bind_ip: String,
    root: PathBuf,
    transport: String,
    exec: Arc<dyn Executor>,
}

impl NvmetTarget {
    /// `transport` is the nvmet transport type, e.g. `rdma` or `tcp`.
    pub fn new(
        bind_ip: impl Into<String>,
        root: impl Into<PathBuf>,
        transport: impl Into<String>,
        exec: Arc<dyn Executor>,
    ) -> Self {
        Self {
            bind_ip: bind_ip.into(),
            root: root.into(),
            transport: transport.into(),
            exec,
        }
    }

    pub fn nqn(volume_id: &str) -> String {
        format!("{NQN_PREFIX}{volume_id}")
    }

    fn subsystem_dir(&self, nqn: &str) -> PathBuf {
        self.root.join("subsystems").join(nqn)
    }

    fn port_dir(&self) -> PathBuf {
        self.root.join("ports").join(PORT_ID)
    }

    fn connection_info(&self, nqn: &str, host_nqn: &str) -> ConnectionInfo {
        ConnectionInfo::new(AccessProtocol::Nvmeof)
            .with("targetDiscovered", true)
            .with("targetNQN", nqn)
            .with("targetIP", self.bind_ip.clone())
            .with("targetPort", NVMEOF_PORT.to_string())
            .with("transportType", self.transport.clone())
            .with("hostNqn", host_nqn)
    }

    async fn load_modules(&self) {
        let transport_module = format!("nvmet-{}", self.transport);
        for module in ["nvmet", transport_module.as_str()] {
            if let Err(e) = self.exec.run("modprobe", &[module]).await {
                warn!(%module, error = %e, "modprobe failed, assuming module is built in");
            }
        }
    }

    async fn build(&self, nqn: &str, req: &ExportRequest) -> Result<(), TargetError> {
        let subsystem = self.subsystem_dir(nqn);
        mkdir(&subsystem).await?;

        if req.initiator == ANY_HOST {
            write_attr(&subsystem.join("attr_allow_any_host"), "1").await?;
        } else {
            write_attr(&subsystem.join("attr_allow_any_host"), "0").await?;
            let host = self.root.join("hosts").join(&req.initiator);
            mkdir(&host).await?;
            let allowed = subsystem.join("allowed_hosts");
            mkdir(&allowed).await?;
            symlink(&host, &allowed.join(&req.initiator)).await?;
        }

        let namespace = subsystem.join("namespaces").join(NAMESPACE_ID);
        mkdir(&namespace).await?;
        write_attr(
            &namespace.join("device_path"),
            &req.device_path.to_string_lossy(),
        )
        .await?;
        write_attr(&namespace.join("enable"), "1").await?;

        let port = self.port_dir();
        if !exists(&port.join("addr_traddr")).await? {
            mkdir(&port).await?;
            write_attr(&port.join("addr_traddr"), &self.bind_ip).await?;
            write_attr(&port.join("addr_trtype"), &self.transport).await?;
            write_attr(&port.join("addr_trsvcid"), &NVMEOF_PORT.to_string()).await?;
            write_attr(&port.join("addr_adrfam"), "ipv4").await?;
        }
        let port_subsystems = port.join("subsystems");
        mkdir(&port_subsystems).await?;
        symlink(&subsystem, &port_subsystems.join(nqn)).await
    }

    async fn teardown(&self, nqn: &str) -> Result<(), TargetError> {
        let subsystem = self.subsystem_dir(nqn);
        remove_link(&self.port_dir().join("subsystems").join(nqn)).await?;

        let namespace = subsystem.join("namespaces").join(NAMESPACE_ID);
        if exists(&namespace).await? {
            write_attr(&namespace.join("enable"), "0").await?;
            remove_configfs_dir(&namespace).await?;
        }

        let allowed = subsystem.join("allowed_hosts");
        if exists(&allowed).await? {
            let mut entries = fs::read_dir(&allowed)
                .await
                .map_err(|e| TargetError::io(&allowed, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| TargetError::io(&allowed, e))?
            {
                remove_link(&entry.path()).await?;
            }
        }
        remove_configfs_dir(&subsystem).await
    }
}

#[async_trait]
impl Target for NvmetTarget {
    fn protocol(&self) -> AccessProtocol {
        AccessProtocol::Nvmeof
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn create_export(&self, req: &ExportRequest) -> Result<ConnectionInfo, TargetError> {
        let nqn = Self::nqn(&req.volume_id);
        if exists(&self.subsystem_dir(&nqn)).await? {
            debug!(%nqn, "subsystem already exported");
            return Ok(self.connection_info(&nqn, &req.initiator));
        }

        self.load_modules().await;
        if let Err(e) = self.build(&nqn, req).await {
            if let Err(rollback) = self.teardown(&nqn).await {
                warn!(%nqn, error = %rollback, "failed to tear down partial subsystem");
            }
            return Err(e);
        }

        info!(%nqn, "nvmeof subsystem created");
        Ok(self.connection_info(&nqn, &req.initiator))
    }

    #[instrument(skip(self))]
    async fn remove_export(&self, volume_id: &str, host_ip: &str) -> Result<(), TargetError> {
        let nqn = Self::nqn(volume_id);
        if !exists(&self.subsystem_dir(&nqn)).await? {
            debug!("subsystem absent, nothing to remove");
            return Ok(());
        }
        self.teardown(&nqn).await?;
        info!(%nqn, "nvmeof subsystem removed");
        Ok(())
    }
}

async fn exists(path: &Path) -> Result<bool, TargetError> {
    fs::try_exists(path).await.map_err(|e| TargetError::io(path, e))
}

async fn mkdir(path: &Path) -> Result<(), TargetError> {
    match fs::create_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(TargetError::io(path, e)),
    }
}

async fn write_attr(path: &Path, value: &str) -> Result<(), TargetError> {
    fs::write(path, value).await.map_err(|e| TargetError::io(path, e))
}

async fn symlink(src: &Path, dst: &Path) -> Result<(), TargetError> {
    match fs::symlink(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(TargetError::io(dst, e)),
    }
}

async fn remove_link(path: &Path) -> Result<(), TargetError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TargetError::io(path, e)),
    }
}

/// configfs removes attribute files with their directory; a plain directory
/// tree (tests, dry runs) needs the recursive variant.
async fn remove_configfs_dir(path: &Path) -> Result<(), TargetError> {
    match fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(_) => match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TargetError::io(path, e)),
        },
    }
}
