//! # libdock: storage dock core
//!
//! Translates backend-agnostic storage requests into backend-specific
//! operations through a pluggable driver contract, serialising operations on
//! the same resource and running everything else concurrently.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`model`] | Volumes, snapshots, attachments, shares, pools, metrics. |
//! | [`error`] | [`DockError`] and its payload-free [`ErrorKind`]. |
//! | [`driver`] | [`Driver`], [`Lifecycle`], [`PoolDiscovery`]. |
//! | [`block`] / [`fileshare`] / [`metric`] | Capability traits. |
//! | [`opts`] | Typed options drivers receive. |
//! | [`registry`] | Backend-type name → driver constructor. |
//! | [`dock`] | [`Dock`] dispatcher and the inbound [`OpRequest`]. |
//! | [`backup`] | Chunked snapshot transport to object storage. |
//! | [`drivers`] | Built-in `lvm`, `huawei_dorado` and `oceanstor` drivers. |
//! | [`config`] | Driver and dock YAML shapes. |
//! | [`lock`] / [`context`] | Per-resource locks and cancellation. |
//! | [`utils`] | Retry and wait loops, password encrypter. |

pub mod backup;
pub mod block;
pub mod config;
pub mod context;
pub mod dock;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod fileshare;
pub mod lock;
pub mod metric;
pub mod model;
pub mod opts;
pub mod registry;
pub mod utils;

pub use block::BlockVolume;
pub use context::{CancelHandle, Context};
pub use dock::{Dock, OpRequest};
pub use driver::{Driver, DriverKind, Lifecycle, PoolDiscovery};
pub use drivers::register_all_drivers;
pub use error::{DockError, ErrorKind};
pub use fileshare::FileShare;
pub use metric::Metric;
pub use model::*;
