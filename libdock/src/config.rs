//! Driver and dock configuration.
//!
//! Driver files live at `/etc/opensds/driver/<backend>.yaml` unless the dock
//! configuration overrides the path:
//!
//! ```yaml
//! authOptions:
//!   endpoints: https://10.0.0.10:8088
//!   username: admin
//!   password: 3f1c...      # hex ciphertext when enableEncrypted is set
//!   pwdEncrypter: aes
//!   enableEncrypted: true
//! pool:
//!   gold:
//!     storageType: block
//!     availabilityZone: az-1
//!     extras:
//!       ioConnectivity:
//!         accessProtocol: iscsi
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libtarget::TargetConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DockError;
use crate::model::{DEFAULT_AVAILABILITY_ZONE, PoolExtras, StorageType};
use crate::utils::pwd::new_pwd_encrypter;

pub const DRIVER_CONFIG_DIR: &str = "/etc/opensds/driver";
pub const DEFAULT_DOCK_CONFIG: &str = "/etc/opensds/dock.yaml";

/// Conventional config path of a driver.
pub fn default_driver_config(backend: &str) -> PathBuf {
    Path::new(DRIVER_CONFIG_DIR).join(format!("{backend}.yaml"))
}

/// Read and parse a YAML file.
pub async fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, DockError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DockError::Config(format!("read {}: {e}", path.display())))?;
    debug!(path = %path.display(), "loaded config");
    serde_yaml::from_str(&text)
        .map_err(|e| DockError::Config(format!("parse {}: {e}", path.display())))
}

/// Per-pool settings from a driver file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolProperties {
    pub storage_type: StorageType,
    pub availability_zone: String,
    pub multi_attach: bool,
    pub extras: PoolExtras,
}

impl Default for PoolProperties {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Block,
            availability_zone: DEFAULT_AVAILABILITY_ZONE.to_owned(),
            multi_attach: false,
            extras: PoolExtras::default(),
        }
    }
}

impl PoolProperties {
    pub fn availability_zone(&self) -> &str {
        if self.availability_zone.is_empty() {
            DEFAULT_AVAILABILITY_ZONE
        } else {
            &self.availability_zone
        }
    }
}

/// Credentials and endpoints of a vendor backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthOptions {
    /// Comma-separated REST endpoints, tried in order.
    #[serde(alias = "uri", alias = "endpoint")]
    pub endpoints: String,
    pub username: String,
    pub password: String,
    pub pwd_encrypter: String,
    pub enable_encrypted: bool,
    /// Accept self-signed array certificates.
    pub insecure: bool,
}

impl AuthOptions {
    pub fn endpoint_list(&self) -> Vec<String> {
        self.endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|e| e.trim_end_matches('/').to_owned())
            .collect()
    }

    /// The plaintext password, decrypting it when configured so.
    pub fn resolve_password(&self) -> Result<String, DockError> {
        resolve_password(&self.password, &self.pwd_encrypter, self.enable_encrypted)
    }
}

pub fn resolve_password(
    password: &str,
    encrypter: &str,
    enabled: bool,
) -> Result<String, DockError> {
    if !enabled {
        return Ok(password.to_owned());
    }
    new_pwd_encrypter(encrypter)?.decrypt(password)
}

// ---------------------------------------------------------------------------
// Dock configuration
// ---------------------------------------------------------------------------

/// Polling bounds for wait loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300,
            timeout_ms: 10_000,
        }
    }
}

impl WaitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), DockError> {
        if self.interval_ms == 0 || self.timeout_ms == 0 {
            return Err(DockError::Config(format!(
                "wait interval and timeout must be positive, got intervalMs {} and timeoutMs {}",
                self.interval_ms, self.timeout_ms
            )));
        }
        Ok(())
    }
}

/// Top-level dock settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DockConfig {
    /// Backend type → driver config path, overriding the default location.
    pub driver_configs: HashMap<String, PathBuf>,
    /// Exporter used for snapshot upload and cloud restore.
    pub exporter: TargetConfig,
    /// Backup driver type used for snapshot upload and restore.
    pub backup_driver: String,
    pub backup_config: Option<PathBuf>,
    pub wait: WaitConfig,
}

impl Default for DockConfig {
    fn default() -> Self {
        Self {
            driver_configs: HashMap::new(),
            exporter: TargetConfig::default(),
            backup_driver: "multi-cloud".to_owned(),
            backup_config: None,
            wait: WaitConfig::default(),
        }
    }
}

impl DockConfig {
    pub async fn load(path: &Path) -> Result<Self, DockError> {
        let config: Self = load_yaml(path).await?;
        config.wait.validate()?;
        Ok(config)
    }

    /// Config path handed to a driver's `setup`, `None` meaning its default.
    pub fn driver_config(&self, backend: &str) -> Option<&Path> {
        self.driver_configs.get(backend).map(PathBuf::as_path)
    }
}
