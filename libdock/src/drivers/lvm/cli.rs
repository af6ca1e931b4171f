//! LVM command wrappers.

use std::sync::Arc;

use libtarget::Executor;
use tracing::{debug, warn};

use crate::error::DockError;

const REMOVE_CONFIG: &str = "activation { retry_deactivation = 1} ";
const REMOVE_CONFIG_IGNORE_SUSPENDED: &str =
    "activation { retry_deactivation = 1} devices { ignore_suspended_devices = 1}";

/// One `vgs` row. Sizes in GiB.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGroup {
    pub name: String,
    pub total_gb: f64,
    pub free_gb: f64,
    pub uuid: String,
}

/// One `lvs` row. Size in GiB.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalVolume {
    pub vg: String,
    pub name: String,
    pub size_gb: f64,
    pub attr: String,
}

impl LogicalVolume {
    /// Origin of at least one snapshot.
    pub fn has_snapshot(&self) -> bool {
        matches!(self.attr.chars().next(), Some('o' | 'O'))
    }

    pub fn is_active(&self) -> bool {
        self.attr.chars().nth(4) == Some('a')
    }
}

pub struct Cli {
    exec: Arc<dyn Executor>,
}

impl Cli {
    pub fn new(exec: Arc<dyn Executor>) -> Self {
        Self { exec }
    }

    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String, DockError> {
        Ok(self.exec.run(program, args).await?)
    }

    pub async fn create_volume(&self, vg: &str, name: &str, size_gb: u64) -> Result<(), DockError> {
        let size = format!("{size_gb}g");
        self.run("lvcreate", &["-Z", "n", "-n", name, "-L", &size, vg])
            .await
            .map(|_| ())
    }

    pub async fn create_snapshot(
        &self,
        vg: &str,
        source: &str,
        name: &str,
        size_gb: u64,
    ) -> Result<(), DockError> {
        let size = format!("{size_gb}g");
        let origin = format!("{vg}/{source}");
        self.run("lvcreate", &["-n", name, "-L", &size, "-p", "r", "-s", &origin])
            .await
            .map(|_| ())
    }

    /// Logical volumes of `vg`, or of every group when `vg` is `None`.
    pub async fn list_lvs(&self, vg: Option<&str>) -> Result<Vec<LogicalVolume>, DockError> {
        let mut args = vec![
            "--noheadings",
            "--unit=g",
            "--nosuffix",
            "-o",
            "vg_name,lv_name,lv_size,lv_attr",
        ];
        if let Some(vg) = vg {
            args.push(vg);
        }
        let out = self.run("lvs", &args).await?;
        Ok(parse_lvs(&out))
    }

    pub async fn lv(&self, vg: &str, name: &str) -> Result<Option<LogicalVolume>, DockError> {
        Ok(self
            .list_lvs(Some(vg))
            .await?
            .into_iter()
            .find(|lv| lv.name == name))
    }

    /// Remove an LV, retrying once after udev settles with suspended devices
    /// ignored.
    pub async fn delete(&self, vg: &str, name: &str) -> Result<(), DockError> {
        let target = format!("{vg}/{name}");
        let first = self
            .run("lvremove", &["--config", REMOVE_CONFIG, "-f", &target])
            .await;
        let Err(e) = first else {
            return Ok(());
        };
        warn!(lv = %target, error = %e, "lvremove failed, retrying after udev settle");
        if let Err(settle) = self.run("udevadm", &["settle"]).await {
            debug!(error = %settle, "udevadm settle failed");
        }
        self.run(
            "lvremove",
            &["--config", REMOVE_CONFIG_IGNORE_SUSPENDED, "-f", &target],
        )
        .await
        .map(|_| ())
    }

    /// Grow an LV. Origins of snapshots are deactivated around the resize.
    pub async fn extend(&self, vg: &str, name: &str, size_gb: u64) -> Result<(), DockError> {
        let target = format!("{vg}/{name}");
        let size = format!("{size_gb}g");
        let lv = self
            .lv(vg, name)
            .await?
            .ok_or_else(|| DockError::NotFound(format!("logical volume {target}")))?;

        if lv.has_snapshot() {
            self.run("lvchange", &["-a", "n", &target]).await?;
            let extended = self.run("lvextend", &["-L", &size, &target]).await;
            self.run("lvchange", &["-a", "y", "--yes", &target]).await?;
            extended.map(|_| ())
        } else {
            self.run("lvextend", &["-L", &size, &target]).await.map(|_| ())
        }
    }

    pub async fn list_vgs(&self) -> Result<Vec<VolumeGroup>, DockError> {
        let out = self
            .run(
                "vgs",
                &["--noheadings", "--nosuffix", "--unit=g", "-o", "name,size,free,uuid"],
            )
            .await?;
        Ok(parse_vgs(&out))
    }

    /// Physical volume device paths.
    pub async fn list_pvs(&self) -> Result<Vec<String>, DockError> {
        let out = self.run("pvs", &["--noheadings", "-o", "pv_name"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

fn parse_size(s: &str) -> f64 {
    s.trim().replace(',', ".").parse().unwrap_or(0.0)
}

pub(crate) fn parse_lvs(out: &str) -> Vec<LogicalVolume> {
    out.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [vg, name, size, attr, ..] => Some(LogicalVolume {
                    vg: (*vg).to_owned(),
                    name: (*name).to_owned(),
                    size_gb: parse_size(size),
                    attr: (*attr).to_owned(),
                }),
                _ => None,
            }
        })
        .collect()
}

pub(crate) fn parse_vgs(out: &str) -> Vec<VolumeGroup> {
    out.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, total, free, uuid, ..] => Some(VolumeGroup {
                    name: (*name).to_owned(),
                    total_gb: parse_size(total),
                    free_gb: parse_size(free),
                    uuid: (*uuid).to_owned(),
                }),
                _ => None,
            }
        })
        .collect()
}
