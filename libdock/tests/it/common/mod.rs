//! Fakes shared by the dock integration tests.

pub mod host;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libdock::backup::BackupDriver;
use libdock::backup::multicloud::{self, MultiCloud};
use libdock::config::{DockConfig, WaitConfig};
use libdock::driver::Driver;
use libdock::drivers::lvm::{self, LvmDriver};
use libdock::registry::{BackupRegistry, DriverRegistry, Registry};
use libdock::Dock;
use libtarget::Exporter;

use self::host::FakeHost;
use self::memory::{FakeConnector, MemStore, RecordingTarget};

/// Part size used by every upload in these tests.
pub const CHUNK: usize = 1024;

/// A dock wired to fakes, plus handles on each of them.
pub struct Harness {
    pub dock: Arc<Dock>,
    pub host: Arc<FakeHost>,
    pub store: Arc<MemStore>,
    pub targets: Arc<RecordingTarget>,
    pub connector: Arc<FakeConnector>,
    pub drivers: Arc<DriverRegistry>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn write_lvm_config(dir: &Path) -> PathBuf {
    let path = dir.join("lvm.yaml");
    std::fs::write(
        &path,
        format!(
            "tgtBindIp: 127.0.0.1\ntgtConfDir: {}\npool:\n  vg001:\n    storageType: block\n    availabilityZone: default\n    extras:\n      ioConnectivity:\n        accessProtocol: iscsi\n",
            dir.join("tgt").display()
        ),
    )
    .unwrap();
    path
}

/// Dock with the `lvm` driver over a [`FakeHost`] holding `vg001` (18 GiB)
/// and the `multi-cloud` backup driver over a [`MemStore`].
pub fn harness() -> Harness {
    harness_with(|_, _| {})
}

/// Like [`harness`], letting the caller register more drivers first.
pub fn harness_with(extra: impl FnOnce(&DriverRegistry, &Path)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let host = FakeHost::new(dir.path().join("tgt"));
    host.add_vg("vg001", 18.0, "uuid-vg001");

    let drivers: Arc<DriverRegistry> = Arc::new(Registry::new("driver"));
    let exec = host.clone();
    drivers
        .register(lvm::DRIVER_NAME, move || {
            Ok(Box::new(LvmDriver::with_executor(exec.clone())) as Box<dyn Driver>)
        })
        .unwrap();
    extra(&drivers, dir.path());

    let store = Arc::new(MemStore::default());
    let backups: Arc<BackupRegistry> = Arc::new(Registry::new("backup driver"));
    let object_store = store.clone();
    backups
        .register(multicloud::DRIVER_NAME, move || {
            Ok(Box::new(MultiCloud::with_store(object_store.clone(), CHUNK)) as Box<dyn BackupDriver>)
        })
        .unwrap();

    let mut config = DockConfig::default();
    config
        .driver_configs
        .insert(lvm::DRIVER_NAME.to_owned(), write_lvm_config(dir.path()));
    config.wait = WaitConfig {
        interval_ms: 5,
        timeout_ms: 200,
    };

    let targets = Arc::new(RecordingTarget::default());
    let connector = Arc::new(FakeConnector::new());
    let dock = Dock::new(config, drivers.clone(), backups)
        .with_exporter(Exporter::with_targets(targets.clone(), targets.clone()))
        .with_connectors(connector.clone(), connector.clone());

    Harness {
        dock: Arc::new(dock),
        host,
        store,
        targets,
        connector,
        drivers,
        dir,
    }
}
