//! Driver lifecycle, pool discovery and the capability-erased [`Driver`].
//!
//! A backend driver always implements [`Lifecycle`] and [`PoolDiscovery`] and
//! exposes whichever of [`BlockVolume`], [`FileShare`] and [`Metric`] it
//! supports through the `as_*` accessors. The dispatcher only ever sees a
//! `dyn Driver`.

use std::path::Path;

use async_trait::async_trait;

use crate::block::BlockVolume;
use crate::error::DockError;
use crate::fileshare::FileShare;
use crate::metric::Metric;
use crate::model::{PoolSpec, ResourceKind};

/// Setup and teardown of a driver instance.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Read configuration, resolve credentials and establish sessions.
    ///
    /// `config_path` overrides the driver's default YAML location. Fails with
    /// [`DockError::Config`], [`DockError::Auth`] or [`DockError::Transport`].
    async fn setup(&mut self, config_path: Option<&Path>) -> Result<(), DockError>;

    /// Release sessions. Calling it twice is harmless.
    async fn unset(&self) -> Result<(), DockError>;
}

#[async_trait]
pub trait PoolDiscovery: Send + Sync {
    /// Pools of the backend restricted to the configured names, with
    /// configured extras merged in.
    async fn list_pools(&self) -> Result<Vec<PoolSpec>, DockError>;
}

/// Variant tags a driver can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Block,
    File,
    Metric,
}

pub trait Driver: Lifecycle + PoolDiscovery {
    /// Registered backend type name.
    fn name(&self) -> &'static str;

    fn as_block(&self) -> Option<&dyn BlockVolume> {
        None
    }

    fn as_file_share(&self) -> Option<&dyn FileShare> {
        None
    }

    fn as_metric(&self) -> Option<&dyn Metric> {
        None
    }

    fn kinds(&self) -> Vec<DriverKind> {
        let mut kinds = Vec::new();
        if self.as_block().is_some() {
            kinds.push(DriverKind::Block);
        }
        if self.as_file_share().is_some() {
            kinds.push(DriverKind::File);
        }
        if self.as_metric().is_some() {
            kinds.push(DriverKind::Metric);
        }
        kinds
    }

    /// Metadata keys the delete path of `kind` needs to find the vendor
    /// object. Requests missing any of them are rejected up front.
    fn vendor_id_keys(&self, _kind: ResourceKind) -> &'static [&'static str] {
        &[]
    }
}
