//! Snapshot upload, remote cleanup and the create-from-snapshot paths.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use libdock::drivers::lvm::{self, KEY_LV_PATH};
use libdock::driver::Driver;
use libdock::{Context, ErrorKind, KEY_BACKUP_ID, KEY_BUCKET, Metadata, OpRequest, SnapshotSpec, VolumeSpec};

use crate::common::memory::{FILE_DRIVER, FileDriver, KEY_FILE};
use crate::common::{Harness, harness, harness_with};

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Harness with a `file` backend next to `lvm`, plus a `stuck` one whose
/// volumes never leave `creating`.
fn file_harness() -> Harness {
    harness_with(|drivers, dir| {
        let root = dir.join("files");
        drivers
            .register(FILE_DRIVER, move || {
                Ok(Box::new(FileDriver::new(root.clone(), false)) as Box<dyn Driver>)
            })
            .unwrap();
        let stuck = dir.join("stuck");
        drivers
            .register("stuck", move || {
                Ok(Box::new(FileDriver::new(stuck.clone(), true)) as Box<dyn Driver>)
            })
            .unwrap();
    })
}

async fn lvm_volume(h: &Harness, id: &str) -> VolumeSpec {
    let req = OpRequest {
        id: id.to_owned(),
        size: 1,
        pool_name: "vg001".to_owned(),
        ..Default::default()
    };
    h.dock
        .create_volume(&Context::background(), lvm::DRIVER_NAME, &req)
        .await
        .unwrap()
}

fn snapshot_req(volume: &VolumeSpec, id: &str, bucket: Option<&str>) -> OpRequest {
    let mut metadata = Metadata::new();
    if let Some(bucket) = bucket {
        metadata.insert(KEY_BUCKET.to_owned(), bucket.to_owned());
    }
    OpRequest {
        id: id.to_owned(),
        volume_id: volume.id.clone(),
        size: volume.size,
        metadata,
        parent_metadata: volume.metadata.clone(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_upload_records_remote_copy() {
    let h = harness();
    let volume = lvm_volume(&h, "v1").await;
    let data = image(3000);
    let device = h.path("s1.img");
    std::fs::write(&device, &data).unwrap();
    h.connector.map_device("s1", &device);

    let snapshot = h
        .dock
        .create_snapshot(&Context::background(), lvm::DRIVER_NAME, &snapshot_req(&volume, "s1", Some("b1")))
        .await
        .unwrap();

    assert_eq!(snapshot.metadata[KEY_BACKUP_ID], "s1");
    assert_eq!(snapshot.metadata[KEY_BUCKET], "b1");
    assert_eq!(h.store.object("b1", "s1"), Some(data));
    assert_eq!(*h.targets.created.lock().unwrap(), ["s1"]);
    assert_eq!(*h.targets.removed.lock().unwrap(), ["s1"]);
    assert_eq!(*h.connector.detached.lock().unwrap(), ["s1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_upload_removes_snapshot() {
    let h = harness();
    let volume = lvm_volume(&h, "v1").await;
    let device = h.path("s1.img");
    std::fs::write(&device, image(2048)).unwrap();
    h.connector.map_device("s1", &device);
    h.store.fail_complete.store(true, Ordering::SeqCst);

    let err = h
        .dock
        .create_snapshot(&Context::background(), lvm::DRIVER_NAME, &snapshot_req(&volume, "s1", Some("b1")))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Backend);
    assert_eq!(h.store.aborted.load(Ordering::SeqCst), 1);
    assert!(!h.host.has_lv("vg001", "_snapshot-s1"));
    assert!(h.host.has_lv("vg001", "volume-v1"));
    assert_eq!(*h.targets.removed.lock().unwrap(), ["s1"]);
    assert_eq!(*h.connector.detached.lock().unwrap(), ["s1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_snapshot_drops_remote_copy() {
    let h = harness();
    let ctx = Context::background();
    let volume = lvm_volume(&h, "v1").await;
    let device = h.path("s1.img");
    std::fs::write(&device, image(100)).unwrap();
    h.connector.map_device("s1", &device);
    let snapshot = h
        .dock
        .create_snapshot(&ctx, lvm::DRIVER_NAME, &snapshot_req(&volume, "s1", Some("b1")))
        .await
        .unwrap();

    let delete = OpRequest {
        id: snapshot.id.clone(),
        volume_id: volume.id.clone(),
        metadata: snapshot.metadata.clone(),
        ..Default::default()
    };
    h.dock.delete_snapshot(&ctx, lvm::DRIVER_NAME, &delete).await.unwrap();

    assert_eq!(h.store.object("b1", "s1"), None);
    assert_eq!(*h.store.removed.lock().unwrap(), ["b1/s1"]);
    assert!(!h.host.has_lv("vg001", "_snapshot-s1"));
    assert_eq!(volume.metadata[KEY_LV_PATH], "/dev/vg001/volume-v1");
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_without_bucket_stays_local() {
    let h = harness();
    let volume = lvm_volume(&h, "v1").await;

    let snapshot = h
        .dock
        .create_snapshot(&Context::background(), lvm::DRIVER_NAME, &snapshot_req(&volume, "s1", None))
        .await
        .unwrap();

    assert!(!snapshot.metadata.contains_key(KEY_BACKUP_ID));
    assert!(h.targets.created.lock().unwrap().is_empty());
}

fn file_of(metadata: &Metadata) -> PathBuf {
    PathBuf::from(&metadata[KEY_FILE])
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_from_local_snapshot_gets_its_data() {
    let h = file_harness();
    let ctx = Context::background();
    let source = h
        .dock
        .create_volume(
            &ctx,
            FILE_DRIVER,
            &OpRequest {
                id: "v1".to_owned(),
                size: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let data = image(4096 * 2 + 100);
    std::fs::write(file_of(&source.metadata), &data).unwrap();
    let snapshot: SnapshotSpec = h
        .dock
        .create_snapshot(&ctx, FILE_DRIVER, &snapshot_req(&source, "s1", None))
        .await
        .unwrap();

    let req = OpRequest {
        id: "v2".to_owned(),
        size: 1,
        snapshot_id: Some("s1".to_owned()),
        snapshot_size: 1,
        parent_metadata: snapshot.metadata.clone(),
        ..Default::default()
    };
    let restored = h.dock.create_volume(&ctx, FILE_DRIVER, &req).await.unwrap();

    assert_eq!(std::fs::read(file_of(&restored.metadata)).unwrap(), data);
    assert_eq!(restored.snapshot_id.as_deref(), Some("s1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn recreating_filled_volume_keeps_it() {
    let h = file_harness();
    let ctx = Context::background();
    let source_req = OpRequest {
        id: "v1".to_owned(),
        size: 1,
        ..Default::default()
    };
    let source = h.dock.create_volume(&ctx, FILE_DRIVER, &source_req).await.unwrap();
    let data = image(5000);
    std::fs::write(file_of(&source.metadata), &data).unwrap();
    let snapshot = h
        .dock
        .create_snapshot(&ctx, FILE_DRIVER, &snapshot_req(&source, "s1", None))
        .await
        .unwrap();
    let from_snapshot = |id: &str| OpRequest {
        id: id.to_owned(),
        size: 1,
        snapshot_id: Some("s1".to_owned()),
        snapshot_size: 1,
        parent_metadata: snapshot.metadata.clone(),
        ..Default::default()
    };
    let restored = h.dock.create_volume(&ctx, FILE_DRIVER, &from_snapshot("v2")).await.unwrap();

    // Any further copy from the snapshot now fails.
    std::fs::remove_file(file_of(&snapshot.metadata)).unwrap();

    let again = h.dock.create_volume(&ctx, FILE_DRIVER, &from_snapshot("v2")).await.unwrap();
    assert_eq!(again.metadata[KEY_FILE], restored.metadata[KEY_FILE]);
    assert_eq!(std::fs::read(file_of(&restored.metadata)).unwrap(), data);

    let err = h
        .dock
        .create_volume(&ctx, FILE_DRIVER, &from_snapshot("v3"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(!h.path("files/volume-v3").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_from_cloud_snapshot_is_downloaded() {
    let h = file_harness();
    let data = image(2500);
    h.store.put("b1", "snap-0", &data);

    let req = OpRequest {
        id: "v2".to_owned(),
        size: 1,
        snapshot_id: Some("snap-0".to_owned()),
        snapshot_from_cloud: true,
        parent_metadata: Metadata::from([
            (KEY_BACKUP_ID.to_owned(), "snap-0".to_owned()),
            (KEY_BUCKET.to_owned(), "b1".to_owned()),
        ]),
        ..Default::default()
    };
    let volume = h
        .dock
        .create_volume(&Context::background(), FILE_DRIVER, &req)
        .await
        .unwrap();

    assert_eq!(std::fs::read(file_of(&volume.metadata)).unwrap(), data);
    assert_eq!(*h.targets.created.lock().unwrap(), ["v2"]);
    assert_eq!(*h.connector.detached.lock().unwrap(), ["v2"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn cloud_restore_needs_backup_keys() {
    let h = file_harness();
    let req = OpRequest {
        id: "v2".to_owned(),
        size: 1,
        snapshot_id: Some("snap-0".to_owned()),
        snapshot_from_cloud: true,
        ..Default::default()
    };

    let err = h
        .dock
        .create_volume(&Context::background(), FILE_DRIVER, &req)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!h.path("files/volume-v2").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_stuck_creating_times_out() {
    let h = file_harness();
    let req = OpRequest {
        id: "v1".to_owned(),
        size: 1,
        ..Default::default()
    };

    let err = h
        .dock
        .create_volume(&Context::background(), "stuck", &req)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(flavor = "multi_thread")]
async fn pools_are_clamped_and_zoned() {
    let h = file_harness();

    let pools = h.dock.list_pools(FILE_DRIVER).await.unwrap();

    assert_eq!(pools[0].total_capacity, 4);
    assert_eq!(pools[0].free_capacity, 4);
    assert_eq!(pools[0].availability_zone, "default");
}
