//! The `lvm` driver behind the dock, against a fake host.

use std::sync::Arc;

use libdock::drivers::lvm::{self, KEY_LV_PATH, KEY_LVS_PATH};
use libdock::{
    AccessProtocol, Component, Context, ErrorKind, HostInfo, MetricName, OpRequest, VolumeSpec, pool_id,
};

use crate::common::harness;

const BACKEND: &str = lvm::DRIVER_NAME;

fn volume_req(id: &str, size: u64) -> OpRequest {
    OpRequest {
        id: id.to_owned(),
        name: id.to_owned(),
        size,
        pool_name: "vg001".to_owned(),
        ..Default::default()
    }
}

fn host() -> HostInfo {
    HostInfo {
        ip: "10.0.0.9".to_owned(),
        initiator: "iqn.1994-05.com.redhat:host-9".to_owned(),
        ..Default::default()
    }
}

fn parent(volume: &VolumeSpec, id: &str) -> OpRequest {
    OpRequest {
        id: id.to_owned(),
        volume_id: volume.id.clone(),
        size: volume.size,
        parent_metadata: volume.metadata.clone(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pools_report_configured_group() {
    let h = harness();

    let pools = h.dock.list_pools(BACKEND).await.unwrap();

    assert_eq!(pools.len(), 1);
    let pool = &pools[0];
    assert_eq!(pool.name, "vg001");
    assert_eq!(pool.id, pool_id("uuid-vg001"));
    assert_eq!((pool.total_capacity, pool.free_capacity), (18, 18));
    assert_eq!(pool.availability_zone, "default");
    assert_eq!(pool.extras.io_connectivity.access_protocol, "iscsi");
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_lifecycle_through_attachment() {
    let h = harness();
    let ctx = Context::background();

    let volume = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 1)).await.unwrap();
    assert_eq!(volume.metadata[KEY_LV_PATH], "/dev/vg001/volume-v1");
    assert_eq!(volume.availability_zone, "default");
    assert!(h.host.has_lv("vg001", "volume-v1"));

    let attach = OpRequest {
        host_info: host(),
        ..parent(&volume, "a1")
    };
    let attachment = h.dock.create_attachment(&ctx, BACKEND, &attach).await.unwrap();
    let info = &attachment.connection_info;
    assert_eq!(info.protocol().unwrap(), AccessProtocol::Iscsi);
    assert_eq!(info.str_field("targetIQN"), Some("iqn.2017-10.io.opensds:v1"));
    assert_eq!(info.str_field("targetPortal"), Some("127.0.0.1:3260"));
    assert_eq!(info.connection_data["targetLun"], 1);
    assert!(h.path("tgt/dock-v1.conf").exists());

    h.dock.delete_attachment(&ctx, BACKEND, &attach).await.unwrap();
    assert!(!h.path("tgt/dock-v1.conf").exists());

    let delete = OpRequest {
        metadata: volume.metadata.clone(),
        ..volume_req("v1", 0)
    };
    h.dock.delete_volume(&ctx, BACKEND, &delete).await.unwrap();
    assert!(!h.host.has_lv("vg001", "volume-v1"));

    let pools = h.dock.list_pools(BACKEND).await.unwrap();
    assert_eq!(pools[0].free_capacity, 18);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_is_idempotent() {
    let h = harness();
    let ctx = Context::background();

    let first = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 1)).await.unwrap();
    let second = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 1)).await.unwrap();

    assert_eq!(first.metadata, second.metadata);
    assert_eq!(h.host.calls("lvcreate").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_creates_of_one_id_make_one_volume() {
    let h = harness();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let dock = Arc::clone(&h.dock);
            tokio::spawn(async move {
                dock.create_volume(&Context::background(), BACKEND, &volume_req("v1", 1))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.host.calls("lvcreate").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_twice_succeeds() {
    let h = harness();
    let ctx = Context::background();
    let volume = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 1)).await.unwrap();
    let delete = OpRequest {
        metadata: volume.metadata,
        ..volume_req("v1", 0)
    };

    h.dock.delete_volume(&ctx, BACKEND, &delete).await.unwrap();
    h.dock.delete_volume(&ctx, BACKEND, &delete).await.unwrap();

    assert_eq!(h.host.calls("lvremove").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_leaves_volume_untouched() {
    let h = harness();
    let ctx = Context::background();
    let volume = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 2)).await.unwrap();

    let snapshot = h.dock.create_snapshot(&ctx, BACKEND, &parent(&volume, "s1")).await.unwrap();
    assert_eq!(snapshot.metadata[KEY_LVS_PATH], "/dev/vg001/_snapshot-s1");
    assert_eq!(snapshot.size, 2);

    // An origin with snapshots cannot go.
    let delete = OpRequest {
        metadata: volume.metadata.clone(),
        ..volume_req("v1", 0)
    };
    let err = h.dock.delete_volume(&ctx, BACKEND, &delete).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);

    let drop_snapshot = OpRequest {
        id: "s1".to_owned(),
        volume_id: "v1".to_owned(),
        metadata: snapshot.metadata.clone(),
        ..Default::default()
    };
    h.dock.delete_snapshot(&ctx, BACKEND, &drop_snapshot).await.unwrap();

    assert!(!h.host.has_lv("vg001", "_snapshot-s1"));
    assert_eq!(h.host.lv_size("vg001", "volume-v1"), Some(2.0));
    h.dock.delete_volume(&ctx, BACKEND, &delete).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_attachment_exports_snapshot() {
    let h = harness();
    let ctx = Context::background();
    let volume = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 1)).await.unwrap();
    let snapshot = h.dock.create_snapshot(&ctx, BACKEND, &parent(&volume, "s1")).await.unwrap();

    let attach = OpRequest {
        id: "sa1".to_owned(),
        snapshot_id: Some("s1".to_owned()),
        host_info: host(),
        access_protocol: "nvmeof".to_owned(),
        parent_metadata: snapshot.metadata.clone(),
        ..Default::default()
    };
    let info = h.dock.create_snapshot_attachment(&ctx, BACKEND, &attach).await.unwrap();

    // Snapshots are always served over iSCSI.
    assert_eq!(info.connection_info.protocol().unwrap(), AccessProtocol::Iscsi);
    assert_eq!(info.connection_info.str_field("targetIQN"), Some("iqn.2017-10.io.opensds:s1"));
    h.dock.delete_snapshot_attachment(&ctx, BACKEND, &attach).await.unwrap();
    assert!(!h.path("tgt/dock-s1.conf").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn extend_and_pull() {
    let h = harness();
    let ctx = Context::background();
    let volume = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 1)).await.unwrap();

    let extend = OpRequest {
        metadata: volume.metadata.clone(),
        ..volume_req("v1", 3)
    };
    let extended = h.dock.extend_volume(&ctx, BACKEND, &extend).await.unwrap();
    assert_eq!(extended.size, 3);
    assert_eq!(h.host.lv_size("vg001", "volume-v1"), Some(3.0));

    let pulled = h.dock.pull_volume(&ctx, BACKEND, &volume_req("v1", 0)).await.unwrap();
    assert_eq!(pulled.size, 3);
    assert_eq!(pulled.metadata[KEY_LV_PATH], "/dev/vg001/volume-v1");

    let err = h.dock.pull_volume(&ctx, BACKEND, &volume_req("v9", 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_backend_touches_nothing() {
    let h = harness();

    let err = h
        .dock
        .create_volume(&Context::background(), "nope", &volume_req("v1", 1))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnknownDriver);
    assert_eq!(h.host.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_never_reach_the_host() {
    let h = harness();
    let ctx = Context::background();

    let err = h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.dock.delete_volume(&ctx, BACKEND, &volume_req("v1", 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains(KEY_LV_PATH), "{err}");

    let orphan = OpRequest {
        id: "s1".to_owned(),
        volume_id: "v1".to_owned(),
        size: 1,
        ..Default::default()
    };
    let err = h.dock.create_snapshot(&ctx, BACKEND, &orphan).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(h.host.calls("lvcreate").is_empty());
    assert!(h.host.calls("lvremove").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn volume_groups_are_not_offered() {
    let h = harness();
    let req = OpRequest {
        id: "g1".to_owned(),
        ..Default::default()
    };

    let err = h
        .dock
        .create_volume_group(&Context::background(), BACKEND, &req)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotImplemented);
}

#[tokio::test(flavor = "multi_thread")]
async fn metrics_cover_volumes_and_disks() {
    let h = harness();
    let ctx = Context::background();
    h.dock.create_volume(&ctx, BACKEND, &volume_req("v1", 1)).await.unwrap();

    let names = h.dock.get_metric_list(BACKEND, "volume").await.unwrap();
    assert_eq!(names, MetricName::ALL.to_vec());
    let err = h.dock.get_metric_list(BACKEND, "pool").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let metrics = h.dock.collect_metrics(BACKEND).await.unwrap();
    let volume: Vec<_> = metrics.iter().filter(|m| m.component == Component::Volume).collect();
    let disk: Vec<_> = metrics.iter().filter(|m| m.component == Component::Disk).collect();
    assert_eq!(volume.len(), 6);
    assert_eq!(disk.len(), 6);
    assert!(volume.iter().all(|m| m.instance_id == "v1" && m.job == "lvm"));
    assert!(volume.iter().all(|m| m.labels["device"] == "vg001-volume--v1"));
    let iops = disk.iter().find(|m| m.name == MetricName::Iops).unwrap();
    assert_eq!(iops.instance_id, "sda");
    assert_eq!(iops.metric_values[0].value, 5.0);

    h.dock.collect_metrics(BACKEND).await.unwrap();
    let version_checks = h.host.calls("sar").iter().filter(|c| c.ends_with("-V")).count();
    assert_eq!(version_checks, 1);

    h.dock.shutdown().await.unwrap();
}
