//! Target exporter error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for export and attach operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// A local command exited unsuccessfully or could not be spawned.
    #[error("command `{command}` failed: {reason}")]
    Command {
        /// The command line that was executed.
        command: String,
        /// Captured stderr or spawn error.
        reason: String,
    },

    /// A filesystem operation on a config file or configfs node failed.
    #[error("io error at {path}: {reason}")]
    Io {
        /// Path that was being accessed.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The export (or attached device) could not be found.
    #[error("target {0} not found")]
    NotFound(String),

    /// The requested protocol cannot be served by this exporter.
    #[error("unsupported access protocol: {0}")]
    Unsupported(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl TargetError {
    /// Create a [`TargetError::Io`] for `path` from any displayable error.
    pub fn io<P: AsRef<std::path::Path>, E: std::fmt::Display>(path: P, e: E) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Create a [`TargetError::Command`] from a command line and a reason.
    pub fn command<E: std::fmt::Display>(command: impl Into<String>, e: E) -> Self {
        Self::Command {
            command: command.into(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = TargetError::io("/etc/tgt/conf.d/x.conf", "permission denied");
        assert_eq!(
            err.to_string(),
            "io error at /etc/tgt/conf.d/x.conf: permission denied"
        );
    }
}
