//! Built-in backend drivers.
//!
//! | Backend type     | Module        | Capabilities          |
//! |------------------|---------------|-----------------------|
//! | `lvm`            | [`lvm`]       | block, metric         |
//! | `huawei_dorado`  | [`dorado`]    | block                 |
//! | `oceanstor`      | [`oceanstor`] | file share            |
//! | `multi-cloud`    | [`crate::backup::multicloud`] | snapshot backup |

pub mod array_rest;
pub mod dorado;
pub mod lvm;
pub mod oceanstor;

use tracing::info;

use crate::backup::BackupDriver;
use crate::backup::multicloud::{self, MultiCloud};
use crate::driver::Driver;
use crate::error::DockError;
use crate::registry::{BackupRegistry, DriverRegistry};

/// Bind every built-in driver. Call once at process start.
pub fn register_all_drivers(drivers: &DriverRegistry, backups: &BackupRegistry) -> Result<(), DockError> {
    drivers.register(lvm::DRIVER_NAME, || Ok(Box::new(lvm::LvmDriver::new()) as Box<dyn Driver>))?;
    drivers.register(dorado::DRIVER_NAME, || {
        Ok(Box::new(dorado::DoradoDriver::new()) as Box<dyn Driver>)
    })?;
    drivers.register(oceanstor::DRIVER_NAME, || {
        Ok(Box::new(oceanstor::OceanStorDriver::new()) as Box<dyn Driver>)
    })?;
    backups.register(multicloud::DRIVER_NAME, || {
        Ok(Box::new(MultiCloud::new()) as Box<dyn BackupDriver>)
    })?;
    info!(drivers = ?drivers.names(), backups = ?backups.names(), "drivers registered");
    Ok(())
}
