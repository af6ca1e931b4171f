//! Dock integration tests: requests go through [`libdock::Dock`] into real
//! drivers running against fake hosts and stores.

mod backup;
mod common;
mod lvm;
mod shares;
