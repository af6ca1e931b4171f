//! File share, ACL and share snapshot flows.

use libdock::driver::Driver;
use libdock::drivers::lvm;
use libdock::{
    AccessCapability, AccessLevel, AccessType, Context, ErrorKind, FileShareSpec, OpRequest, ShareProtocol,
};

use crate::common::memory::{KEY_SHARE, MEM_SHARES, MemShares};
use crate::common::{Harness, harness_with};

fn share_harness() -> Harness {
    harness_with(|drivers, _| {
        drivers
            .register(MEM_SHARES, || Ok(Box::new(MemShares::default()) as Box<dyn Driver>))
            .unwrap();
    })
}

fn share_req(id: &str, protocols: &str) -> OpRequest {
    OpRequest {
        id: id.to_owned(),
        name: id.to_owned(),
        size: 1,
        pool_name: "pool1".to_owned(),
        access_protocol: protocols.to_owned(),
        ..Default::default()
    }
}

fn acl_req(share: &FileShareSpec, id: &str, protocol: &str, access_type: AccessType, to: &str) -> OpRequest {
    OpRequest {
        id: id.to_owned(),
        share_id: share.id.clone(),
        access_protocol: protocol.to_owned(),
        access_type: Some(access_type),
        access_to: to.to_owned(),
        access_capability: vec![AccessCapability::Read, AccessCapability::Write],
        parent_metadata: share.metadata.clone(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn share_is_only_removed_once_empty() {
    let h = share_harness();
    let ctx = Context::background();

    let share = h
        .dock
        .create_file_share(&ctx, MEM_SHARES, &share_req("sh1", "nfs, cifs"))
        .await
        .unwrap();
    assert_eq!(share.protocols, [ShareProtocol::Nfs, ShareProtocol::Cifs]);
    assert_eq!(share.export_locations.len(), 2);
    assert_eq!(share.metadata[KEY_SHARE], "sh1");

    let acl_request = acl_req(&share, "acl1", "nfs", AccessType::Ip, "10.0.0.0/24");
    let acl = h.dock.create_file_share_acl(&ctx, MEM_SHARES, &acl_request).await.unwrap();
    assert_eq!(acl.access_level, AccessLevel::Rw);

    let snapshot_request = OpRequest {
        id: "ss1".to_owned(),
        share_id: share.id.clone(),
        size: 1,
        parent_metadata: share.metadata.clone(),
        ..Default::default()
    };
    let snapshot = h
        .dock
        .create_file_share_snapshot(&ctx, MEM_SHARES, &snapshot_request)
        .await
        .unwrap();

    let delete = OpRequest {
        metadata: share.metadata.clone(),
        ..share_req("sh1", "nfs,cifs")
    };
    let err = h.dock.delete_file_share(&ctx, MEM_SHARES, &delete).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);

    let drop_snapshot = OpRequest {
        metadata: snapshot.metadata.clone(),
        ..snapshot_request
    };
    h.dock
        .delete_file_share_snapshot(&ctx, MEM_SHARES, &drop_snapshot)
        .await
        .unwrap();
    let drop_acl = OpRequest {
        metadata: acl.metadata.clone(),
        ..acl_request
    };
    h.dock.delete_file_share_acl(&ctx, MEM_SHARES, &drop_acl).await.unwrap();

    h.dock.delete_file_share(&ctx, MEM_SHARES, &delete).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_falls_back_to_profile() {
    let h = share_harness();
    let req = OpRequest {
        profile: r#"{"provisioningProperties":{"ioConnectivity":{"accessProtocol":"nfs"}}}"#.to_owned(),
        ..share_req("sh1", "")
    };

    let share = h
        .dock
        .create_file_share(&Context::background(), MEM_SHARES, &req)
        .await
        .unwrap();

    assert_eq!(share.protocols, [ShareProtocol::Nfs]);
    assert_eq!(share.export_locations, ["127.0.0.1:/share_sh1"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_acls_are_rejected() {
    let h = share_harness();
    let ctx = Context::background();
    let share = h
        .dock
        .create_file_share(&ctx, MEM_SHARES, &share_req("sh1", "nfs,cifs"))
        .await
        .unwrap();

    let cases = [
        acl_req(&share, "a1", "cifs", AccessType::Ip, "10.0.0.1"),
        acl_req(&share, "a2", "nfs", AccessType::Ip, "not-an-address"),
        acl_req(&share, "a3", "nfs,cifs", AccessType::User, "alice"),
        OpRequest {
            access_capability: vec![AccessCapability::Execute],
            ..acl_req(&share, "a4", "nfs", AccessType::Ip, "10.0.0.1")
        },
    ];
    for req in &cases {
        let err = h.dock.create_file_share_acl(&ctx, MEM_SHARES, req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{}: {err}", req.id);
    }

    let user = acl_req(&share, "a5", "cifs", AccessType::User, "alice");
    let acl = h.dock.create_file_share_acl(&ctx, MEM_SHARES, &user).await.unwrap();
    assert_eq!(acl.access_to, "alice");
}

#[tokio::test(flavor = "multi_thread")]
async fn share_snapshot_needs_share_ids() {
    let h = share_harness();
    let req = OpRequest {
        id: "ss1".to_owned(),
        share_id: "sh1".to_owned(),
        size: 1,
        ..Default::default()
    };

    let err = h
        .dock
        .create_file_share_snapshot(&Context::background(), MEM_SHARES, &req)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains(KEY_SHARE), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn block_backend_has_no_shares() {
    let h = share_harness();

    let err = h
        .dock
        .create_file_share(&Context::background(), lvm::DRIVER_NAME, &share_req("sh1", "nfs"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotImplemented);
}
