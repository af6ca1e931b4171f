//! iSCSI targets managed through `tgt`.
//!
//! Each export is one config file under the tgt config directory:
//!
//! ```text
//! <conf_dir>/dock-<volume-id>.conf
//! <target iqn.2017-10.io.opensds:<volume-id>>
//!     backing-store <device>
//!     driver iscsi
//!     initiator-address <host-ip>
//!     initiator-name <initiator>
//!     incominguser <user> <secret>
//!     write-cache on
//! </target>
//! ```
//!
//! `tgt-admin --update` loads the file, `tgt-admin --show` is parsed for the
//! target id and LUN, and `tgt-admin --force --delete` tears it down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::chap::ChapCredentials;
use crate::error::TargetError;
use crate::exec::Executor;
use crate::exporter::Target;
use crate::types::{ANY_HOST, AccessProtocol, ConnectionInfo, ExportRequest};

pub const IQN_PREFIX: &str = "iqn.2017-10.io.opensds:";
pub const ISCSI_PORT: u16 = 3260;
const CONF_PREFIX: &str = "dock-";
const TGT_ADMIN: &str = "tgt-admin";

/// iSCSI exporter writing one tgt config file per volume.
pub struct TgtTarget {
    bind_ip: String,
    conf_dir: PathBuf,
    exec: Arc<dyn Executor>,
}

impl TgtTarget {
    /// * `bind_ip`: portal address advertised to initiators
    /// * `conf_dir`: tgt include directory, usually `/etc/tgt/conf.d`
    pub fn new(bind_ip: impl Into<String>, conf_dir: impl Into<PathBuf>, exec: Arc<dyn Executor>) -> Self {
        Self {
            bind_ip: bind_ip.into(),
            conf_dir: conf_dir.into(),
            exec,
        }
    }

    pub fn iqn(volume_id: &str) -> String {
        format!("{IQN_PREFIX}{volume_id}")
    }

    fn conf_path(&self, volume_id: &str) -> PathBuf {
        self.conf_dir.join(format!("{CONF_PREFIX}{volume_id}.conf"))
    }

    async fn show(&self) -> Result<String, TargetError> {
        self.exec.run(TGT_ADMIN, &["--show"]).await
    }

    fn connection_info(&self, iqn: &str, lun: u32, chap: Option<&ChapCredentials>) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(AccessProtocol::Iscsi)
            .with("targetDiscovered", true)
            .with("targetIQN", vec![iqn.to_owned()])
            .with("targetPortal", vec![format!("{}:{ISCSI_PORT}", self.bind_ip)])
            .with("discard", false)
            .with("targetLun", lun);
        if let Some(chap) = chap {
            info = info
                .with("authMethod", "chap")
                .with("authUserName", chap.username.clone())
                .with("authPassword", chap.secret.clone());
        }
        info
    }

    /// Connection data for an already loaded target, if there is one.
    async fn existing(&self, req: &ExportRequest, iqn: &str) -> Result<Option<ConnectionInfo>, TargetError> {
        let path = self.conf_path(&req.volume_id);
        let conf = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TargetError::io(&path, e)),
        };
        let show = self.show().await?;
        if parse_tid(&show, iqn).is_none() {
            return Ok(None);
        }
        let backing = parse_backing_store(&conf).unwrap_or_else(|| req.device_path.clone());
        let lun = parse_lun(&show, &backing).ok_or_else(|| TargetError::NotFound(iqn.to_owned()))?;
        Ok(Some(self.connection_info(iqn, lun, parse_chap(&conf).as_ref())))
    }
}

#[async_trait]
impl Target for TgtTarget {
    fn protocol(&self) -> AccessProtocol {
        AccessProtocol::Iscsi
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn create_export(&self, req: &ExportRequest) -> Result<ConnectionInfo, TargetError> {
        let iqn = Self::iqn(&req.volume_id);
        if let Some(info) = self.existing(req, &iqn).await? {
            debug!(%iqn, "target already exported");
            return Ok(info);
        }

        tokio::fs::create_dir_all(&self.conf_dir)
            .await
            .map_err(|e| TargetError::io(&self.conf_dir, e))?;
        let path = self.conf_path(&req.volume_id);
        tokio::fs::write(&path, render_conf(&iqn, req))
            .await
            .map_err(|e| TargetError::io(&path, e))?;

        let loaded = async {
            self.exec.run(TGT_ADMIN, &["--update", &iqn]).await?;
            let show = self.show().await?;
            if parse_tid(&show, &iqn).is_none() {
                return Err(TargetError::NotFound(iqn.clone()));
            }
            parse_lun(&show, &req.device_path).ok_or_else(|| TargetError::NotFound(iqn.clone()))
        }
        .await;

        let lun = match loaded {
            Ok(lun) => lun,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %rm, "failed to remove target config");
                }
                return Err(e);
            }
        };

        info!(%iqn, lun, "iscsi target created");
        Ok(self.connection_info(&iqn, lun, req.chap.as_ref()))
    }

    #[instrument(skip(self))]
    async fn remove_export(&self, volume_id: &str, host_ip: &str) -> Result<(), TargetError> {
        let path = self.conf_path(volume_id);
        if !tokio::fs::try_exists(&path).await.map_err(|e| TargetError::io(&path, e))? {
            debug!("target config absent, nothing to remove");
            return Ok(());
        }
        let iqn = Self::iqn(volume_id);
        let show = self.show().await?;
        if parse_tid(&show, &iqn).is_some() {
            self.exec.run(TGT_ADMIN, &["--force", "--delete", &iqn]).await?;
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| TargetError::io(&path, e))?;
        info!(%iqn, "iscsi target removed");
        Ok(())
    }
}

fn render_conf(iqn: &str, req: &ExportRequest) -> String {
    let mut conf = format!(
        "<target {iqn}>\n    backing-store {}\n    driver iscsi\n",
        req.device_path.display()
    );
    conf.push_str(&format!("    initiator-address {}\n", req.host_ip));
    if req.initiator != ANY_HOST {
        conf.push_str(&format!("    initiator-name {}\n", req.initiator));
    }
    if let Some(chap) = &req.chap {
        conf.push_str(&format!("    incominguser {} {}\n", chap.username, chap.secret));
    }
    conf.push_str("    write-cache on\n</target>\n");
    conf
}

fn conf_value<'a>(conf: &'a str, key: &str) -> Option<&'a str> {
    conf.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(key).map(str::trim))
}

fn parse_backing_store(conf: &str) -> Option<PathBuf> {
    conf_value(conf, "backing-store").map(PathBuf::from)
}

fn parse_chap(conf: &str) -> Option<ChapCredentials> {
    let mut fields = conf_value(conf, "incominguser")?.split_whitespace();
    Some(ChapCredentials::new(fields.next()?, fields.next()?))
}

/// Target id of `iqn` in `tgt-admin --show` output (`Target <tid>: <iqn>`).
pub(crate) fn parse_tid(show: &str, iqn: &str) -> Option<u32> {
    show.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Target ")?;
        let (tid, name) = rest.split_once(':')?;
        (name.trim() == iqn).then(|| tid.trim().parse().ok()).flatten()
    })
}

/// LUN whose backing store is `path`: the nearest `LUN: <n>` line above the
/// matching `Backing store path:` line.
pub(crate) fn parse_lun(show: &str, path: &Path) -> Option<u32> {
    let wanted = path.to_string_lossy();
    let mut lun = None;
    for line in show.lines().map(str::trim) {
        if let Some(n) = line.strip_prefix("LUN:") {
            lun = n.trim().parse().ok();
        } else if let Some(p) = line.strip_prefix("Backing store path:") {
            if p.trim() == wanted {
                return lun;
            }
        }
    }
    None
}
