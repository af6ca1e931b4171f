//! `multi-cloud` backup driver.
//!
//! Streams snapshot images to the multi-cloud gateway as multipart objects
//! keyed by snapshot id, and back again on restore.
//!
//! ```yaml
//! endpoint: http://127.0.0.1:8088
//! timeout: 3600          # seconds, control requests
//! uploadTimeout: 1800    # seconds, per part / range
//! authOptions:
//!   strategy: keystone
//!   authUrl: http://127.0.0.1/identity/v3
//!   domainName: Default
//!   username: admin
//!   password: opensds@123
//!   tenantName: admin
//! ```

pub mod auth;
pub mod client;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tracing::{info, instrument};

use self::auth::{AuthSession, AuthStrategy};
use self::client::MultiCloudClient;
use crate::backup::store::ObjectStore;
use crate::backup::transfer::{ChunkTransfer, DEFAULT_CHUNK_SIZE};
use crate::backup::{BackupDriver, BackupSpec};
use crate::config::{load_yaml, resolve_password};
use crate::context::Context;
use crate::error::DockError;

pub const DRIVER_NAME: &str = "multi-cloud";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/opensds/driver/multi-cloud.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudAuthOptions {
    pub strategy: AuthStrategy,
    pub auth_url: String,
    pub domain_name: String,
    pub username: String,
    pub password: String,
    pub pwd_encrypter: String,
    pub enable_encrypted: bool,
    pub tenant_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiCloudConfig {
    pub endpoint: String,
    /// Seconds.
    pub timeout: u64,
    /// Seconds.
    pub upload_timeout: u64,
    pub auth_options: CloudAuthOptions,
}

impl Default for MultiCloudConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8088".to_owned(),
            timeout: 60 * 60,
            upload_timeout: 30 * 60,
            auth_options: CloudAuthOptions::default(),
        }
    }
}

pub struct MultiCloud {
    store: Option<Arc<dyn ObjectStore>>,
    chunk_size: usize,
}

impl Default for MultiCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiCloud {
    pub fn new() -> Self {
        Self {
            store: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Driver over an already connected store; `setup` is then a no-op.
    pub fn with_store(store: Arc<dyn ObjectStore>, chunk_size: usize) -> Self {
        Self {
            store: Some(store),
            chunk_size,
        }
    }

    fn store(&self) -> Result<&dyn ObjectStore, DockError> {
        self.store
            .as_deref()
            .ok_or_else(|| DockError::Config(format!("{DRIVER_NAME} driver is not set up")))
    }

    fn transfer(&self) -> Result<ChunkTransfer<'_>, DockError> {
        Ok(ChunkTransfer::new(self.store()?).with_chunk_size(self.chunk_size))
    }
}

#[async_trait]
impl BackupDriver for MultiCloud {
    async fn setup(&mut self, config_path: Option<&Path>) -> Result<(), DockError> {
        if self.store.is_some() {
            return Ok(());
        }
        let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        let conf: MultiCloudConfig = load_yaml(path).await?;
        let opts = &conf.auth_options;
        let auth = match opts.strategy {
            AuthStrategy::Keystone => AuthSession::new(
                AuthStrategy::Keystone,
                &opts.auth_url,
                &opts.domain_name,
                &opts.username,
                &resolve_password(&opts.password, &opts.pwd_encrypter, opts.enable_encrypted)?,
                &opts.tenant_name,
            ),
            AuthStrategy::Noauth => AuthSession::noauth(),
        };
        let client = MultiCloudClient::new(
            &conf.endpoint,
            auth,
            Duration::from_secs(conf.timeout),
            Duration::from_secs(conf.upload_timeout),
        )?;
        self.store = Some(Arc::new(client));
        info!(endpoint = %conf.endpoint, "multi-cloud backup driver ready");
        Ok(())
    }

    async fn clean_up(&self) -> Result<(), DockError> {
        Ok(())
    }

    #[instrument(skip(self, ctx, device), fields(backup_id = %spec.id))]
    async fn backup(&self, ctx: &Context, spec: &BackupSpec, device: &mut File) -> Result<String, DockError> {
        let bucket = spec.bucket()?;
        device
            .rewind()
            .await
            .map_err(|e| DockError::Transport(format!("rewind device: {e}")))?;
        self.transfer()?.upload(ctx, bucket, &spec.id, device).await?;
        Ok(spec.id.clone())
    }

    #[instrument(skip(self, ctx, spec, device))]
    async fn restore(
        &self,
        ctx: &Context,
        spec: &BackupSpec,
        backup_id: &str,
        device: &mut File,
    ) -> Result<(), DockError> {
        let bucket = spec.bucket()?;
        self.transfer()?.download(ctx, bucket, backup_id, device).await?;
        Ok(())
    }

    #[instrument(skip(self, _ctx), fields(backup_id = %spec.id))]
    async fn delete(&self, _ctx: &Context, spec: &BackupSpec) -> Result<(), DockError> {
        let bucket = spec.bucket()?;
        self.store()?.remove_object(bucket, &spec.id).await
    }
}
