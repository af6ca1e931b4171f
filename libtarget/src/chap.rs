//! CHAP credentials for iSCSI targets.

use std::fmt;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Length of a generated CHAP user name.
pub const CHAP_USERNAME_LEN: usize = 20;
/// Length of a generated CHAP secret.
pub const CHAP_SECRET_LEN: usize = 16;

/// A CHAP user / secret pair bound into a target ACL.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapCredentials {
    pub username: String,
    pub secret: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Fresh alphanumeric credentials from the thread-local CSPRNG.
    pub fn generate() -> Self {
        Self {
            username: random_alphanumeric(CHAP_USERNAME_LEN),
            secret: random_alphanumeric(CHAP_SECRET_LEN),
        }
    }
}

impl fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn random_alphanumeric(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
