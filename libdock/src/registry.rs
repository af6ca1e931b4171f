//! Backend-type name → driver constructor.
//!
//! Registration happens once at process start from
//! [`register_all_drivers`](crate::drivers::register_all_drivers); lookups are
//! read-only afterwards. The same [`Registry`] type backs the block/file
//! driver registry and the backup driver registry.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::backup::BackupDriver;
use crate::driver::Driver;
use crate::error::DockError;

/// Zero-argument constructor of a driver instance.
pub type Constructor<T> = Arc<dyn Fn() -> Result<T, DockError> + Send + Sync>;

pub type DriverRegistry = Registry<Box<dyn Driver>>;
pub type BackupRegistry = Registry<Box<dyn BackupDriver>>;

pub struct Registry<T> {
    what: &'static str,
    ctors: RwLock<HashMap<String, Constructor<T>>>,
}

impl<T> Registry<T> {
    /// `what` names the registry in errors and logs.
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            ctors: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `name` to `ctor`. Fails when `name` is already bound.
    pub fn register<F>(&self, name: &str, ctor: F) -> Result<(), DockError>
    where
        F: Fn() -> Result<T, DockError> + Send + Sync + 'static,
    {
        let mut ctors = self.ctors.write();
        if ctors.contains_key(name) {
            return Err(DockError::DuplicateRegistration(format!(
                "{} {name} is already registered",
                self.what
            )));
        }
        ctors.insert(name.to_owned(), Arc::new(ctor));
        debug!(registry = self.what, %name, "registered");
        Ok(())
    }

    /// Remove `name`; absent names are ignored.
    pub fn unregister(&self, name: &str) {
        self.ctors.write().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.read().contains_key(name)
    }

    /// Construct a fresh, not yet set up, instance.
    pub fn create(&self, name: &str) -> Result<T, DockError> {
        let ctor = self.ctors.read().get(name).cloned().ok_or_else(|| {
            DockError::UnknownDriver(format!("no {} registered for {name}", self.what))
        })?;
        ctor()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.ctors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

static DRIVERS: LazyLock<Arc<DriverRegistry>> =
    LazyLock::new(|| Arc::new(Registry::new("driver")));
static BACKUP_DRIVERS: LazyLock<Arc<BackupRegistry>> =
    LazyLock::new(|| Arc::new(Registry::new("backup driver")));

/// Process-wide block/file driver registry.
pub fn drivers() -> Arc<DriverRegistry> {
    DRIVERS.clone()
}

/// Process-wide backup driver registry.
pub fn backup_drivers() -> Arc<BackupRegistry> {
    BACKUP_DRIVERS.clone()
}
