//! Protocol-neutral export management.
//!
//! [`Exporter`] owns one [`Target`] per supported protocol and keeps track of
//! which protocol each volume was exported with, so a volume never ends up
//! with two targets and removal always reaches the right backend.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::TargetError;
use crate::exec::Executor;
use crate::iscsi::TgtTarget;
use crate::nvmeof::{DEFAULT_NVMET_ROOT, NvmetTarget};
use crate::types::{AccessProtocol, ConnectionInfo, ExportKind, ExportRequest};

/// One protocol backend able to publish a local device.
#[async_trait]
pub trait Target: Send + Sync {
    fn protocol(&self) -> AccessProtocol;

    /// Create the target for `req.volume_id`, or return the connection data
    /// of the one that already exists.
    async fn create_export(&self, req: &ExportRequest) -> Result<ConnectionInfo, TargetError>;

    /// Tear the target down. Succeeds when there is nothing to remove.
    async fn remove_export(&self, volume_id: &str, host_ip: &str) -> Result<(), TargetError>;
}

/// Exporter settings, embedded in driver and dock configuration files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConfig {
    /// Portal address advertised in connection data.
    pub tgt_bind_ip: String,
    /// tgt include directory.
    pub tgt_conf_dir: PathBuf,
    /// nvmet configfs root.
    pub nvmet_root: PathBuf,
    /// nvmet transport type.
    pub nvmeof_transport: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            tgt_bind_ip: "127.0.0.1".to_owned(),
            tgt_conf_dir: PathBuf::from("/etc/tgt/conf.d"),
            nvmet_root: PathBuf::from(DEFAULT_NVMET_ROOT),
            nvmeof_transport: "rdma".to_owned(),
        }
    }
}

/// Local exporter for iSCSI and NVMe-oF.
pub struct Exporter {
    iscsi: Arc<dyn Target>,
    nvmeof: Arc<dyn Target>,
    /// Protocol each live export was created with, keyed by volume id.
    exports: DashMap<String, AccessProtocol>,
}

impl Exporter {
    pub fn new(config: &TargetConfig, exec: Arc<dyn Executor>) -> Self {
        Self::with_targets(
            Arc::new(TgtTarget::new(
                config.tgt_bind_ip.clone(),
                config.tgt_conf_dir.clone(),
                exec.clone(),
            )),
            Arc::new(NvmetTarget::new(
                config.tgt_bind_ip.clone(),
                config.nvmet_root.clone(),
                config.nvmeof_transport.clone(),
                exec,
            )),
        )
    }

    pub fn with_targets(iscsi: Arc<dyn Target>, nvmeof: Arc<dyn Target>) -> Self {
        Self {
            iscsi,
            nvmeof,
            exports: DashMap::new(),
        }
    }

    /// Protocol an export of `kind` is actually served with.
    pub fn effective_protocol(
        kind: ExportKind,
        requested: AccessProtocol,
    ) -> Result<AccessProtocol, TargetError> {
        match (kind, requested) {
            (_, AccessProtocol::Iscsi) => Ok(AccessProtocol::Iscsi),
            (ExportKind::Snapshot, AccessProtocol::Nvmeof) => Ok(AccessProtocol::Iscsi),
            (ExportKind::Volume, AccessProtocol::Nvmeof) => Ok(AccessProtocol::Nvmeof),
            (_, other) => Err(TargetError::Unsupported(other.to_string())),
        }
    }

    fn target(&self, protocol: AccessProtocol) -> Result<&Arc<dyn Target>, TargetError> {
        match protocol {
            AccessProtocol::Iscsi => Ok(&self.iscsi),
            AccessProtocol::Nvmeof => Ok(&self.nvmeof),
            other => Err(TargetError::Unsupported(other.to_string())),
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, ?kind, %protocol))]
    pub async fn create_export(
        &self,
        kind: ExportKind,
        protocol: AccessProtocol,
        req: ExportRequest,
    ) -> Result<ConnectionInfo, TargetError> {
        let req = req.normalized();
        let mut protocol = Self::effective_protocol(kind, protocol)?;
        if let Some(existing) = self.exports.get(&req.volume_id) {
            debug!(existing = %*existing, "volume already exported");
            protocol = *existing;
        }
        let info = self.target(protocol)?.create_export(&req).await?;
        self.exports.insert(req.volume_id.clone(), protocol);
        Ok(info)
    }

    #[instrument(skip(self))]
    pub async fn remove_export(&self, volume_id: &str, host_ip: &str) -> Result<(), TargetError> {
        match self.exports.get(volume_id).map(|p| *p) {
            Some(protocol) => self.target(protocol)?.remove_export(volume_id, host_ip).await?,
            None => {
                // Unknown to this process: clear whatever either backend holds.
                self.iscsi.remove_export(volume_id, host_ip).await?;
                self.nvmeof.remove_export(volume_id, host_ip).await?;
            }
        }
        self.exports.remove(volume_id);
        Ok(())
    }
}
