//! Typed calls against the OceanStor NAS REST API.

use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

pub use crate::drivers::array_rest::{StoragePool, sectors_to_gb};
use crate::drivers::array_rest::{ArrayRest, ErrorCodes, decode, decode_list, gb_to_sectors, string_or_number};
use crate::error::DockError;
use crate::model::{AccessLevel, ShareProtocol};

pub const STATUS_HEALTH: &str = "1";
pub const STATUS_FS_RUNNING: &str = "27";

pub const ERROR_FS_NOT_EXIST: i64 = 1073752065;
pub const ERROR_SHARE_NOT_EXIST: i64 = 1077939717;
pub const ERROR_SNAPSHOT_NOT_EXIST: i64 = 1073754118;
pub const ERROR_ACCESS_NOT_EXIST: i64 = 1077939728;
pub const ERROR_SHARE_PATH_EXISTS: i64 = 1077939724;
pub const ERROR_ACCESS_EXISTS: i64 = 1077939727;

pub const CODES: ErrorCodes = ErrorCodes {
    not_found: &[
        ERROR_FS_NOT_EXIST,
        ERROR_SHARE_NOT_EXIST,
        ERROR_SNAPSHOT_NOT_EXIST,
        ERROR_ACCESS_NOT_EXIST,
    ],
    already_exists: &[ERROR_SHARE_PATH_EXISTS, ERROR_ACCESS_EXISTS],
};

const TYPE_POOL: u32 = 216;
const TYPE_FILESYSTEM: &str = "40";
const TYPE_FS_SNAPSHOT: &str = "48";
const NFS_CLIENT_TYPE: &str = "16409";
const PAGE: usize = 100;

/// Array names use underscores where dock ids carry dashes.
pub fn array_name(s: &str) -> String {
    s.replace('-', "_")
}

pub fn share_path(name: &str) -> String {
    format!("/{}/", array_name(name))
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct FileSystem {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
    #[serde(rename = "CAPACITY", default, deserialize_with = "string_or_number")]
    pub capacity: String,
    #[serde(rename = "HEALTHSTATUS", default)]
    pub health_status: String,
    #[serde(rename = "RUNNINGSTATUS", default)]
    pub running_status: String,
}

impl FileSystem {
    pub fn is_ready(&self) -> bool {
        self.health_status == STATUS_HEALTH && self.running_status == STATUS_FS_RUNNING
    }
}

/// NFS or CIFS share.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Share {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
    #[serde(rename = "SHAREPATH", default)]
    pub share_path: String,
    #[serde(rename = "FSID", default)]
    pub fs_id: String,
}

/// One client entry of a share's access list.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct ShareAccess {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct FsSnapshot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
}

fn share_collection(protocol: ShareProtocol) -> &'static str {
    match protocol {
        ShareProtocol::Nfs => "NFSHARE",
        ShareProtocol::Cifs => "CIFSHARE",
    }
}

fn access_collection(protocol: ShareProtocol) -> &'static str {
    match protocol {
        ShareProtocol::Nfs => "NFS_SHARE_AUTH_CLIENT",
        ShareProtocol::Cifs => "CIFS_SHARE_AUTH_CLIENT",
    }
}

pub struct OceanStorClient {
    rest: Arc<dyn ArrayRest>,
}

impl OceanStorClient {
    pub fn new(rest: Arc<dyn ArrayRest>) -> Self {
        Self { rest }
    }

    async fn get<T: DeserializeOwned + Default>(&self, path: &str, what: &str) -> Result<T, DockError> {
        decode(self.rest.call(Method::GET, path, None).await?, what)
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Vec<T>, DockError> {
        decode_list(self.rest.call(Method::GET, path, None).await?, what)
    }

    async fn post<T: DeserializeOwned + Default>(&self, path: &str, body: Value, what: &str) -> Result<T, DockError> {
        decode(self.rest.call(Method::POST, path, Some(body)).await?, what)
    }

    async fn delete(&self, path: &str) -> Result<(), DockError> {
        match self.rest.call(Method::DELETE, path, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Pools and filesystems
    // -----------------------------------------------------------------------

    pub async fn list_pools(&self) -> Result<Vec<StoragePool>, DockError> {
        self.list("/storagepool", "storagepool").await
    }

    pub async fn pool_id(&self, name: &str) -> Result<String, DockError> {
        self.list::<StoragePool>(&format!("/storagepool?filter=NAME::{name}"), "storagepool")
            .await?
            .into_iter()
            .next()
            .map(|p| p.id)
            .ok_or_else(|| DockError::NotFound(format!("storage pool {name}")))
    }

    pub async fn create_filesystem(&self, name: &str, size_gb: u64, pool_id: &str) -> Result<FileSystem, DockError> {
        let body = json!({
            "PARENTID": pool_id,
            "NAME": name,
            "PARENTTYPE": TYPE_POOL,
            "ALLOCTYPE": 1,
            "CAPACITY": gb_to_sectors(size_gb),
        });
        self.post("/filesystem", body, "filesystem").await
    }

    pub async fn get_filesystem(&self, id: &str) -> Result<FileSystem, DockError> {
        self.get(&format!("/filesystem/{id}"), "filesystem").await
    }

    pub async fn find_filesystem(&self, name: &str) -> Result<Option<FileSystem>, DockError> {
        Ok(self
            .list::<FileSystem>(&format!("/filesystem?filter=NAME::{name}"), "filesystem")
            .await?
            .into_iter()
            .next())
    }

    pub async fn delete_filesystem(&self, id: &str) -> Result<(), DockError> {
        self.delete(&format!("/filesystem/{id}")).await
    }

    // -----------------------------------------------------------------------
    // Shares
    // -----------------------------------------------------------------------

    pub async fn find_share(&self, protocol: ShareProtocol, name: &str) -> Result<Option<Share>, DockError> {
        let coll = share_collection(protocol);
        let filter = match protocol {
            ShareProtocol::Nfs => format!("SHAREPATH::{}", share_path(name)),
            ShareProtocol::Cifs => format!("NAME::{}", array_name(name)),
        };
        Ok(self
            .list::<Share>(&format!("/{coll}?filter={filter}&range=[0-{PAGE}]"), coll)
            .await?
            .into_iter()
            .next())
    }

    pub async fn create_share(&self, protocol: ShareProtocol, name: &str, fs_id: &str) -> Result<Share, DockError> {
        let body = match protocol {
            ShareProtocol::Nfs => json!({
                "DESCRIPTION": "",
                "FSID": fs_id,
                "SHAREPATH": share_path(name),
            }),
            ShareProtocol::Cifs => json!({
                "SHAREPATH": share_path(name),
                "DESCRIPTION": "",
                "ABEENABLE": "false",
                "ENABLENOTIFY": "true",
                "ENABLEOPLOCK": "true",
                "NAME": array_name(name),
                "FSID": fs_id,
                "TENANCYID": "0",
            }),
        };
        let coll = share_collection(protocol);
        self.post(&format!("/{coll}"), body, coll).await
    }

    pub async fn delete_share(&self, protocol: ShareProtocol, id: &str) -> Result<(), DockError> {
        self.delete(&format!("/{}/{id}", share_collection(protocol).to_lowercase()))
            .await
    }

    // -----------------------------------------------------------------------
    // Access lists
    // -----------------------------------------------------------------------

    /// Every client entry of a share, paged through in blocks of 100.
    pub async fn list_access(&self, protocol: ShareProtocol, share_id: &str) -> Result<Vec<ShareAccess>, DockError> {
        let coll = access_collection(protocol);
        let mut all = Vec::new();
        loop {
            let begin = all.len();
            let page: Vec<ShareAccess> = self
                .list(
                    &format!("/{coll}?filter=PARENTID::{share_id}&range=[{begin}-{}]", begin + PAGE),
                    coll,
                )
                .await?;
            let short = page.len() < PAGE;
            all.extend(page);
            if short {
                return Ok(all);
            }
        }
    }

    pub async fn allow_access(
        &self,
        protocol: ShareProtocol,
        share_id: &str,
        access_to: &str,
        level: AccessLevel,
    ) -> Result<ShareAccess, DockError> {
        let rw = u8::from(level == AccessLevel::Rw);
        let body = match protocol {
            ShareProtocol::Nfs => json!({
                "TYPE": NFS_CLIENT_TYPE,
                "NAME": access_to,
                "PARENTID": share_id,
                "ACCESSVAL": rw,
                "SYNC": "0",
                "ALLSQUASH": "1",
                "ROOTSQUASH": "0",
            }),
            ShareProtocol::Cifs => json!({
                "NAME": access_to,
                "PARENTID": share_id,
                "PERMISSION": rw,
                "DOMAINTYPE": "2",
            }),
        };
        let coll = access_collection(protocol);
        self.post(&format!("/{coll}"), body, coll).await
    }

    pub async fn remove_access(&self, protocol: ShareProtocol, access_id: &str) -> Result<(), DockError> {
        self.delete(&format!("/{}/{access_id}", access_collection(protocol)))
            .await
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub async fn create_snapshot(&self, fs_id: &str, name: &str) -> Result<FsSnapshot, DockError> {
        let body = json!({
            "PARENTTYPE": TYPE_FILESYSTEM,
            "TYPE": TYPE_FS_SNAPSHOT,
            "PARENTID": fs_id,
            "NAME": array_name(name),
            "DESCRIPTION": "",
        });
        self.post("/FSSNAPSHOT", body, "fs snapshot").await
    }

    pub async fn list_snapshots(&self, fs_id: &str) -> Result<Vec<FsSnapshot>, DockError> {
        self.list(
            &format!("/FSSNAPSHOT?sortby=TIMESTAMP,d&range=[0-{PAGE}]&PARENTID={fs_id}"),
            "fs snapshot",
        )
        .await
    }

    pub async fn delete_snapshot(&self, id: &str) -> Result<(), DockError> {
        self.delete(&format!("/FSSNAPSHOT/{id}")).await
    }
}
