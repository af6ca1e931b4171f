//! # libtarget: local block exports for the storage dock
//!
//! `libtarget` publishes a local block device (an LVM logical volume or
//! snapshot) to a remote host over iSCSI (`tgt`) or NVMe-oF (kernel `nvmet`
//! configfs), and attaches such exports on the local host when the dock needs
//! to stream a device to or from an object store.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Access protocols, export requests and [`ConnectionInfo`]. |
//! | [`error`] | [`TargetError`] enum covering all failure modes. |
//! | [`exec`] | [`Executor`] seam over local commands. |
//! | [`chap`] | Per-export CHAP credential generation. |
//! | [`iscsi`] | [`TgtTarget`]: `tgt-admin` based iSCSI targets. |
//! | [`nvmeof`] | [`NvmetTarget`]: configfs based NVMe-oF subsystems. |
//! | [`exporter`] | [`Exporter`]: protocol selection, one target per volume. |
//! | [`connector`] | [`Connector`]: host-side attach / detach of an export. |

pub mod chap;
pub mod connector;
pub mod error;
pub mod exec;
pub mod exporter;
pub mod iscsi;
pub mod nvmeof;
pub mod types;

pub use chap::ChapCredentials;
pub use connector::{Connector, IscsiConnector, NvmeofConnector};
pub use error::TargetError;
pub use exec::{Executor, ShellExecutor};
pub use exporter::{Exporter, Target, TargetConfig};
pub use iscsi::TgtTarget;
pub use nvmeof::NvmetTarget;
pub use types::*;
