//! Dock error types.
//!
//! Every failure surfaced by a driver or by the dispatcher is a [`DockError`].
//! The variant is the error *kind* callers branch on; the message carries the
//! detail. The dispatcher prefixes messages with the operation, resource id
//! and backend through [`DockError::context`] without changing the kind.

use std::fmt;

use libtarget::TargetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for dock operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum DockError {
    /// Request failed validation before reaching a driver.
    #[error("validation error: {0}")]
    Validation(String),

    /// No driver is registered for the backend type.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// A constructor is already bound to the backend type.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Driver or dock configuration is absent or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// The backend rejected credentials.
    #[error("auth error: {0}")]
    Auth(String),

    /// HTTP, SSH or local command failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The backend answered with an error code.
    #[error("backend error: {0}")]
    Backend(String),

    /// The driver does not offer the requested capability.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

/// Payload-free discriminant of [`DockError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    UnknownDriver,
    DuplicateRegistration,
    Config,
    Auth,
    Transport,
    AlreadyExists,
    NotFound,
    Backend,
    NotImplemented,
    Canceled,
    Timeout,
}

impl DockError {
    pub fn backend<E: fmt::Display>(e: E) -> Self {
        Self::Backend(e.to_string())
    }

    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    pub fn config<E: fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn validation<E: fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownDriver(_) => ErrorKind::UnknownDriver,
            Self::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            Self::Config(_) => ErrorKind::Config,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Transport(_) => ErrorKind::Transport,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Backend(_) => ErrorKind::Backend,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Canceled(_) => ErrorKind::Canceled,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(m)
            | Self::UnknownDriver(m)
            | Self::DuplicateRegistration(m)
            | Self::Config(m)
            | Self::Auth(m)
            | Self::Transport(m)
            | Self::AlreadyExists(m)
            | Self::NotFound(m)
            | Self::Backend(m)
            | Self::NotImplemented(m)
            | Self::Canceled(m)
            | Self::Timeout(m) => m,
        }
    }

    fn map_message(self, f: impl FnOnce(String) -> String) -> Self {
        match self {
            Self::Validation(m) => Self::Validation(f(m)),
            Self::UnknownDriver(m) => Self::UnknownDriver(f(m)),
            Self::DuplicateRegistration(m) => Self::DuplicateRegistration(f(m)),
            Self::Config(m) => Self::Config(f(m)),
            Self::Auth(m) => Self::Auth(f(m)),
            Self::Transport(m) => Self::Transport(f(m)),
            Self::AlreadyExists(m) => Self::AlreadyExists(f(m)),
            Self::NotFound(m) => Self::NotFound(f(m)),
            Self::Backend(m) => Self::Backend(f(m)),
            Self::NotImplemented(m) => Self::NotImplemented(f(m)),
            Self::Canceled(m) => Self::Canceled(f(m)),
            Self::Timeout(m) => Self::Timeout(f(m)),
        }
    }

    /// Prefix the message with `op`, `resource_id` and `backend`.
    pub fn context(self, op: &str, resource_id: &str, backend: &str) -> Self {
        self.map_message(|m| format!("{op} {resource_id} on {backend}: {m}"))
    }
}

impl From<TargetError> for DockError {
    fn from(e: TargetError) -> Self {
        match e {
            TargetError::Command { .. } | TargetError::Io { .. } => Self::Transport(e.to_string()),
            TargetError::NotFound(_) => Self::NotFound(e.to_string()),
            TargetError::Unsupported(_) | TargetError::Invalid(_) => Self::Validation(e.to_string()),
        }
    }
}
