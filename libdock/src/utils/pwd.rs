//! Password encryption for driver configuration files.
//!
//! Ciphertext is `hex(nonce || aes-256-gcm(ciphertext + tag))`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::DockError;

const NONCE_LEN: usize = 12;
const DEFAULT_PASSPHRASE: &str = "opensds-dock-password-encrypter";
/// Overrides the built-in passphrase the AES key is derived from.
pub const PASSPHRASE_ENV: &str = "DOCK_PWD_PASSPHRASE";

pub trait PwdEncrypter: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, DockError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, DockError>;
}

/// Build the encrypter named in `pwdEncrypter`.
pub fn new_pwd_encrypter(name: &str) -> Result<Box<dyn PwdEncrypter>, DockError> {
    match name.to_ascii_lowercase().as_str() {
        "aes" => Ok(Box::new(AesEncrypter::from_env())),
        other => Err(DockError::Config(format!("unknown pwdEncrypter {other:?}"))),
    }
}

/// AES-256-GCM with a key derived from a passphrase by SHA-256.
pub struct AesEncrypter {
    key: [u8; 32],
}

impl AesEncrypter {
    pub fn new(passphrase: &str) -> Self {
        Self {
            key: Sha256::digest(passphrase.as_bytes()).into(),
        }
    }

    pub fn from_env() -> Self {
        match std::env::var(PASSPHRASE_ENV) {
            Ok(p) if !p.is_empty() => Self::new(&p),
            _ => Self::default(),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, DockError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(DockError::config)
    }
}

impl Default for AesEncrypter {
    fn default() -> Self {
        Self::new(DEFAULT_PASSPHRASE)
    }
}

impl PwdEncrypter for AesEncrypter {
    fn encrypt(&self, plaintext: &str) -> Result<String, DockError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| DockError::Config(format!("encrypt password: {e}")))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, DockError> {
        let raw = hex::decode(ciphertext.trim())
            .map_err(|e| DockError::Config(format!("password is not hex: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(DockError::Config("password ciphertext too short".into()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| DockError::Config(format!("decrypt password: {e}")))?;
        String::from_utf8(plain).map_err(DockError::config)
    }
}
