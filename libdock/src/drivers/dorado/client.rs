//! Typed calls against the Dorado REST API.

use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

pub use crate::drivers::array_rest::{StoragePool, gb_to_sectors, sectors_to_gb};
use crate::drivers::array_rest::{ArrayRest, ErrorCodes, decode, decode_list, string_or_number};
use crate::error::DockError;

pub const STATUS_HEALTH: &str = "1";
pub const STATUS_LUN_READY: &str = "27";
pub const STATUS_LUNCOPY_COMPLETE: &str = "40";

pub const ERROR_LUN_NOT_EXIST: i64 = 1077936859;
pub const ERROR_SNAPSHOT_NOT_EXIST: i64 = 1077937880;
pub const ERROR_HOST_NOT_EXIST: i64 = 1077937498;
pub const ERROR_LUNCOPY_NOT_EXIST: i64 = 1077950183;
pub const ERROR_HOST_ALREADY_IN_GROUP: i64 = 1077937501;
pub const ERROR_LUN_ALREADY_IN_GROUP: i64 = 1077936862;
pub const ERROR_ASSOCIATION_EXISTS: i64 = 1073804556;

pub const CODES: ErrorCodes = ErrorCodes {
    not_found: &[
        ERROR_LUN_NOT_EXIST,
        ERROR_SNAPSHOT_NOT_EXIST,
        ERROR_HOST_NOT_EXIST,
        ERROR_LUNCOPY_NOT_EXIST,
    ],
    already_exists: &[
        ERROR_HOST_ALREADY_IN_GROUP,
        ERROR_LUN_ALREADY_IN_GROUP,
        ERROR_ASSOCIATION_EXISTS,
    ],
};

// Object type ids used by association calls.
const TYPE_LUN: u32 = 11;
const TYPE_HOST: u32 = 21;
const TYPE_HOST_GROUP: u32 = 14;
const TYPE_LUN_GROUP: u32 = 256;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Lun {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
    #[serde(rename = "CAPACITY", default, deserialize_with = "string_or_number")]
    pub capacity: String,
    #[serde(rename = "DESCRIPTION", default)]
    pub description: String,
    #[serde(rename = "HEALTHSTATUS", default)]
    pub health_status: String,
    #[serde(rename = "RUNNINGSTATUS", default)]
    pub running_status: String,
}

impl Lun {
    pub fn is_ready(&self) -> bool {
        self.health_status == STATUS_HEALTH && self.running_status == STATUS_LUN_READY
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Snapshot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
    #[serde(rename = "PARENTID", default)]
    pub parent_id: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct LunCopy {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "HEALTHSTATUS", default)]
    pub health_status: String,
    #[serde(rename = "RUNNINGSTATUS", default)]
    pub running_status: String,
}

/// Hosts, host groups, LUN groups and mapping views.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Named {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TargetPort {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct HostLun {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "ASSOCIATEMETADATA", default)]
    associate_metadata: String,
}

/// Target port id `0+iqn.2006-08.com.huawei:oceanstor:...::20000:10.0.0.7,t,0x01`
/// → `(iqn, ip)`.
pub(crate) fn parse_target_port(id: &str) -> Option<(String, String)> {
    let head = id.split(',').next()?;
    let iqn = head.split_once('+')?.1;
    let ip = iqn.rsplit(':').next()?;
    Some((iqn.to_owned(), ip.to_owned()))
}

pub struct DoradoClient {
    rest: Arc<dyn ArrayRest>,
}

impl DoradoClient {
    pub fn new(rest: Arc<dyn ArrayRest>) -> Self {
        Self { rest }
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DockError> {
        self.rest.call(method, path, body).await
    }

    async fn find<T: serde::de::DeserializeOwned>(&self, coll: &str, name: &str) -> Result<Option<T>, DockError> {
        let data = self.call(Method::GET, &format!("/{coll}?filter=NAME::{name}"), None).await?;
        Ok(decode_list::<T>(data, coll)?.into_iter().next())
    }

    async fn delete(&self, path: &str) -> Result<(), DockError> {
        match self.call(Method::DELETE, path, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(%path, "already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create an association, treating an existing one as success.
    async fn associate(&self, method: Method, path: &str, body: Value) -> Result<(), DockError> {
        match self.call(method, path, Some(body)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Pools
    // -----------------------------------------------------------------------

    pub async fn list_pools(&self) -> Result<Vec<StoragePool>, DockError> {
        let data = self.call(Method::GET, "/storagepool?range=[0-100]", None).await?;
        decode_list(data, "storagepool")
    }

    pub async fn pool_id(&self, name: &str) -> Result<String, DockError> {
        self.find::<StoragePool>("storagepool", name)
            .await?
            .map(|p| p.id)
            .ok_or_else(|| DockError::NotFound(format!("storage pool {name}")))
    }

    // -----------------------------------------------------------------------
    // LUNs
    // -----------------------------------------------------------------------

    pub async fn create_lun(&self, name: &str, size_gb: u64, desc: &str, pool_id: &str) -> Result<Lun, DockError> {
        let body = json!({
            "NAME": name,
            "CAPACITY": gb_to_sectors(size_gb),
            "DESCRIPTION": desc,
            "ALLOCTYPE": 1,
            "PARENTID": pool_id,
            "WRITEPOLICY": 1,
        });
        decode(self.call(Method::POST, "/lun", Some(body)).await?, "lun")
    }

    pub async fn get_lun(&self, id: &str) -> Result<Lun, DockError> {
        decode(self.call(Method::GET, &format!("/lun/{id}"), None).await?, "lun")
    }

    pub async fn find_lun(&self, name: &str) -> Result<Option<Lun>, DockError> {
        self.find("lun", name).await
    }

    pub async fn extend_lun(&self, id: &str, size_gb: u64) -> Result<(), DockError> {
        let body = json!({ "ID": id, "CAPACITY": gb_to_sectors(size_gb) });
        self.call(Method::PUT, "/lun/expand", Some(body)).await.map(|_| ())
    }

    pub async fn delete_lun(&self, id: &str) -> Result<(), DockError> {
        self.delete(&format!("/lun/{id}")).await
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub async fn create_snapshot(&self, lun_id: &str, name: &str, desc: &str) -> Result<Snapshot, DockError> {
        let body = json!({
            "PARENTTYPE": TYPE_LUN,
            "PARENTID": lun_id,
            "NAME": name,
            "DESCRIPTION": desc,
        });
        decode(self.call(Method::POST, "/snapshot", Some(body)).await?, "snapshot")
    }

    pub async fn activate_snapshot(&self, id: &str) -> Result<(), DockError> {
        let body = json!({ "SNAPSHOTLIST": [id] });
        self.call(Method::POST, "/snapshot/activate", Some(body)).await.map(|_| ())
    }

    pub async fn stop_snapshot(&self, id: &str) -> Result<(), DockError> {
        let body = json!({ "ID": id });
        self.call(Method::PUT, "/snapshot/stop", Some(body)).await.map(|_| ())
    }

    pub async fn find_snapshot(&self, name: &str) -> Result<Option<Snapshot>, DockError> {
        self.find("snapshot", name).await
    }

    pub async fn delete_snapshot(&self, id: &str) -> Result<(), DockError> {
        self.delete(&format!("/snapshot/{id}")).await
    }

    // -----------------------------------------------------------------------
    // LUN copy
    // -----------------------------------------------------------------------

    pub async fn create_lun_copy(&self, name: &str, source: &str, target: &str, speed: u32) -> Result<String, DockError> {
        let body = json!({
            "NAME": name,
            "COPYSPEED": speed,
            "SOURCELUN": format!("INVALID;{source};INVALID;INVALID;INVALID"),
            "TARGETLUN": format!("INVALID;{target};INVALID;INVALID;INVALID"),
        });
        let copy: LunCopy = decode(self.call(Method::POST, "/luncopy", Some(body)).await?, "luncopy")?;
        Ok(copy.id)
    }

    pub async fn start_lun_copy(&self, id: &str) -> Result<(), DockError> {
        let body = json!({ "ID": id });
        self.call(Method::PUT, "/luncopy/start", Some(body)).await.map(|_| ())
    }

    pub async fn get_lun_copy(&self, id: &str) -> Result<LunCopy, DockError> {
        decode(self.call(Method::GET, &format!("/luncopy/{id}"), None).await?, "luncopy")
    }

    pub async fn delete_lun_copy(&self, id: &str) -> Result<(), DockError> {
        self.delete(&format!("/luncopy/{id}")).await
    }

    // -----------------------------------------------------------------------
    // Hosts and mapping
    // -----------------------------------------------------------------------

    pub async fn find_host(&self, name: &str) -> Result<Option<Named>, DockError> {
        self.find("host", name).await
    }

    pub async fn ensure_host(&self, name: &str, ip: &str) -> Result<String, DockError> {
        if let Some(host) = self.find_host(name).await? {
            return Ok(host.id);
        }
        let body = json!({ "NAME": name, "OPERATIONSYSTEM": 0, "IP": ip });
        let host: Named = decode(self.call(Method::POST, "/host", Some(body)).await?, "host")?;
        Ok(host.id)
    }

    /// Register `iqn` on the array and bind it to `host_id`.
    pub async fn ensure_initiator(&self, host_id: &str, iqn: &str) -> Result<(), DockError> {
        match self.call(Method::GET, &format!("/iscsi_initiator/{iqn}"), None).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                self.call(Method::POST, "/iscsi_initiator", Some(json!({ "ID": iqn })))
                    .await?;
            }
            Err(e) => return Err(e),
        }
        let body = json!({ "ID": iqn, "PARENTTYPE": TYPE_HOST, "PARENTID": host_id });
        self.associate(Method::PUT, &format!("/iscsi_initiator/{iqn}"), body).await
    }

    async fn ensure_named(&self, coll: &str, name: &str, extra: Value) -> Result<String, DockError> {
        if let Some(obj) = self.find::<Named>(coll, name).await? {
            return Ok(obj.id);
        }
        let mut body = json!({ "NAME": name });
        if let (Some(map), Value::Object(extra)) = (body.as_object_mut(), extra) {
            map.extend(extra);
        }
        let obj: Named = decode(self.call(Method::POST, &format!("/{coll}"), Some(body)).await?, coll)?;
        Ok(obj.id)
    }

    pub async fn ensure_host_group(&self, name: &str, host_id: &str) -> Result<String, DockError> {
        let group = self.ensure_named("hostgroup", name, Value::Null).await?;
        let body = json!({ "ID": group, "ASSOCIATEOBJTYPE": TYPE_HOST, "ASSOCIATEOBJID": host_id });
        self.associate(Method::POST, "/hostgroup/associate", body).await?;
        Ok(group)
    }

    pub async fn ensure_lun_group(&self, name: &str, lun_id: &str) -> Result<String, DockError> {
        let group = self.ensure_named("lungroup", name, json!({ "APPTYPE": 0 })).await?;
        let body = json!({ "ID": group, "ASSOCIATEOBJTYPE": TYPE_LUN, "ASSOCIATEOBJID": lun_id });
        self.associate(Method::POST, "/lungroup/associate", body).await?;
        Ok(group)
    }

    pub async fn ensure_mapping_view(&self, name: &str, host_group: &str, lun_group: &str) -> Result<String, DockError> {
        let view = self.ensure_named("mappingview", name, Value::Null).await?;
        for (kind, id) in [(TYPE_HOST_GROUP, host_group), (TYPE_LUN_GROUP, lun_group)] {
            let body = json!({ "ID": view, "ASSOCIATEOBJTYPE": kind, "ASSOCIATEOBJID": id });
            self.associate(Method::PUT, "/mappingview/create_associate", body).await?;
        }
        Ok(view)
    }

    pub async fn find_group(&self, coll: &str, name: &str) -> Result<Option<String>, DockError> {
        Ok(self.find::<Named>(coll, name).await?.map(|g| g.id))
    }

    /// LUNs left in a LUN group.
    pub async fn lun_group_size(&self, group: &str) -> Result<usize, DockError> {
        let data = self
            .call(
                Method::GET,
                &format!("/lun/associate?ASSOCIATEOBJTYPE={TYPE_LUN_GROUP}&ASSOCIATEOBJID={group}"),
                None,
            )
            .await?;
        Ok(decode_list::<Named>(data, "lun")?.len())
    }

    pub async fn remove_lun_from_group(&self, group: &str, lun_id: &str) -> Result<(), DockError> {
        self.delete(&format!(
            "/lungroup/associate?ID={group}&ASSOCIATEOBJTYPE={TYPE_LUN}&ASSOCIATEOBJID={lun_id}"
        ))
        .await
    }

    pub async fn remove_from_view(&self, view: &str, kind_is_host_group: bool, id: &str) -> Result<(), DockError> {
        let kind = if kind_is_host_group { TYPE_HOST_GROUP } else { TYPE_LUN_GROUP };
        let body = json!({ "ID": view, "ASSOCIATEOBJTYPE": kind, "ASSOCIATEOBJID": id });
        self.call(Method::PUT, "/mappingview/remove_associate", Some(body))
            .await
            .map(|_| ())
    }

    pub async fn remove_host_from_group(&self, group: &str, host_id: &str) -> Result<(), DockError> {
        self.delete(&format!(
            "/host/associate?ID={group}&ASSOCIATEOBJTYPE={TYPE_HOST}&ASSOCIATEOBJID={host_id}"
        ))
        .await
    }

    pub async fn remove_initiator(&self, iqn: &str) -> Result<(), DockError> {
        let body = json!({ "ID": iqn });
        self.call(Method::PUT, "/iscsi_initiator/remove_iscsi_from_host", Some(body))
            .await
            .map(|_| ())
    }

    pub async fn delete_object(&self, coll: &str, id: &str) -> Result<(), DockError> {
        self.delete(&format!("/{coll}/{id}")).await
    }

    /// IQN of the target port bound to `target_ip`.
    pub async fn target_iqn(&self, target_ip: &str) -> Result<String, DockError> {
        let data = self.call(Method::GET, "/iscsi_tgt_port", None).await?;
        decode_list::<TargetPort>(data, "iscsi_tgt_port")?
            .iter()
            .filter_map(|p| parse_target_port(&p.id))
            .find(|(_, ip)| ip == target_ip)
            .map(|(iqn, _)| iqn)
            .ok_or_else(|| DockError::Config(format!("no iscsi target port on {target_ip}")))
    }

    /// LUN number `lun_id` is presented as to `host_id`.
    pub async fn host_lun_id(&self, host_id: &str, lun_id: &str) -> Result<u64, DockError> {
        let data = self
            .call(
                Method::GET,
                &format!("/lun/associate?TYPE={TYPE_LUN}&ASSOCIATEOBJTYPE={TYPE_HOST}&ASSOCIATEOBJID={host_id}"),
                None,
            )
            .await?;
        let luns = decode_list::<HostLun>(data, "host lun")?;
        let lun = luns
            .iter()
            .find(|l| l.id == lun_id)
            .ok_or_else(|| DockError::NotFound(format!("lun {lun_id} is not mapped to host {host_id}")))?;
        let meta: Value = serde_json::from_str(&lun.associate_metadata)
            .map_err(|e| DockError::Backend(format!("malformed lun association: {e}")))?;
        match &meta["HostLUNID"] {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| DockError::Backend(format!("lun {lun_id} has no host lun id")))
    }
}
