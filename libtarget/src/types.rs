//! Shared export types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chap::ChapCredentials;
use crate::error::TargetError;

/// Host value meaning "any initiator / any address".
pub const ANY_HOST: &str = "ALL";

// ---------------------------------------------------------------------------
// Access protocol
// ---------------------------------------------------------------------------

/// Block access protocol a volume is published with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessProtocol {
    #[default]
    Iscsi,
    Nvmeof,
    FibreChannel,
    Rbd,
}

impl AccessProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iscsi => "iscsi",
            Self::Nvmeof => "nvmeof",
            Self::FibreChannel => "fibre_channel",
            Self::Rbd => "rbd",
        }
    }
}

impl fmt::Display for AccessProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessProtocol {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iscsi" => Ok(Self::Iscsi),
            "nvmeof" => Ok(Self::Nvmeof),
            "fibre_channel" | "fc" => Ok(Self::FibreChannel),
            "rbd" => Ok(Self::Rbd),
            other => Err(TargetError::Unsupported(other.to_owned())),
        }
    }
}

/// What kind of device is being exported.
///
/// Snapshot exports are always served over iSCSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Volume,
    Snapshot,
}

// ---------------------------------------------------------------------------
// Requests & connection data
// ---------------------------------------------------------------------------

/// Parameters for publishing one device.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Dock resource id the target is named after.
    pub volume_id: String,
    /// Local block device backing the target.
    pub device_path: PathBuf,
    /// Address allowed to connect, or [`ANY_HOST`].
    pub host_ip: String,
    /// Initiator name (IQN or host NQN) allowed to connect, or [`ANY_HOST`].
    pub initiator: String,
    /// CHAP credentials bound into the target ACL.
    pub chap: Option<ChapCredentials>,
}

impl ExportRequest {
    pub fn new(volume_id: impl Into<String>, device_path: impl Into<PathBuf>) -> Self {
        Self {
            volume_id: volume_id.into(),
            device_path: device_path.into(),
            host_ip: ANY_HOST.to_owned(),
            initiator: ANY_HOST.to_owned(),
            chap: None,
        }
    }

    /// Replace empty host fields with [`ANY_HOST`].
    pub fn normalized(mut self) -> Self {
        if self.host_ip.is_empty() {
            self.host_ip = ANY_HOST.to_owned();
        }
        if self.initiator.is_empty() {
            self.initiator = ANY_HOST.to_owned();
        }
        self
    }
}

/// Everything a host needs to reach an export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Protocol tag, e.g. `"iscsi"` or `"nvmeof"`.
    pub driver_volume_type: String,
    /// Protocol-specific connection data.
    #[serde(rename = "data", default)]
    pub connection_data: Map<String, Value>,
}

impl ConnectionInfo {
    pub fn new(protocol: AccessProtocol) -> Self {
        Self {
            driver_volume_type: protocol.as_str().to_owned(),
            connection_data: Map::new(),
        }
    }

    /// Builder-style insert into the connection data.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.connection_data.insert(key.to_owned(), value.into());
        self
    }

    /// Read a string field; arrays yield their first element.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        match self.connection_data.get(key)? {
            Value::String(s) => Some(s),
            Value::Array(items) => items.first().and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn protocol(&self) -> Result<AccessProtocol, TargetError> {
        self.driver_volume_type.parse()
    }
}
