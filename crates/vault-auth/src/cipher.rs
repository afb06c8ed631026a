//! AES-256-GCM password encryption with per-user key files
//!
//! Ciphertext format: `base64(nonce || sealed)` with a 12-byte random
//! nonce. Key files hold the raw 32 key bytes and are named
//! `encryptionkey-{tenant}-{username}` inside the store directory. A key
//! file is written once and never replaced.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use rand::RngExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;

const KEY_FILE_PREFIX: &str = "encryptionkey";

pub type EncryptionKey = Secret<Vec<u8>>;

pub struct SecretCipher {
    key_dir: PathBuf,
}

impl SecretCipher {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn key_file_name(tenant: &str, username: &str) -> String {
        format!("{KEY_FILE_PREFIX}-{tenant}-{username}")
    }

    /// Encrypt `plaintext`, returning the ciphertext and the key used.
    pub fn encrypt(key: &EncryptionKey, plaintext: &str) -> Result<(String, EncryptionKey)> {
        let cipher = new_cipher(key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok((STANDARD.encode(out), key.clone()))
    }

    /// Decrypt a value produced by `encrypt`. Wrong keys and tampered
    /// ciphertexts both fail tag verification.
    pub fn decrypt(ciphertext: &str, key: &EncryptionKey) -> Result<String> {
        let cipher = new_cipher(key)?;
        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| Error::Crypto(format!("ciphertext is not base64: {e}")))?;
        if raw.len() < NONCE_SIZE {
            return Err(Error::Crypto("ciphertext is too short".into()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_SIZE);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::Crypto("authentication failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("decrypted value is not UTF-8: {e}")))
    }

    /// Key stored in `file_name`, or fresh random bytes when there is none.
    /// Generated keys are not written anywhere.
    pub async fn get_encryption_key(&self, file_name: &str) -> Result<EncryptionKey> {
        if let Some(key) = self.read_key(file_name).await? {
            return Ok(key);
        }
        let mut bytes = vec![0u8; KEY_SIZE];
        rand::rng().fill(&mut bytes[..]);
        Ok(Secret::new(bytes))
    }

    /// Write `key` to `file_name` unless the file already exists. Returns
    /// whether the key was written.
    pub async fn persist_encryption_key(&self, file_name: &str, key: &EncryptionKey) -> Result<bool> {
        tokio::fs::create_dir_all(&self.key_dir)
            .await
            .map_err(|e| Error::Crypto(format!("creating {}: {e}", self.key_dir.display())))?;

        let path = self.key_dir.join(file_name);
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = match options.open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "encryption key already exists");
                return Ok(false);
            }
            Err(e) => {
                return Err(Error::Crypto(format!("creating {}: {e}", path.display())));
            }
        };
        file.write_all(key.expose())
            .await
            .map_err(|e| Error::Crypto(format!("writing {}: {e}", path.display())))?;
        file.flush()
            .await
            .map_err(|e| Error::Crypto(format!("writing {}: {e}", path.display())))?;

        info!(path = %path.display(), "created encryption key");
        Ok(true)
    }

    /// Make sure a key file exists for the user and return its key.
    pub async fn provision_key(&self, tenant: &str, username: &str) -> Result<EncryptionKey> {
        let name = Self::key_file_name(tenant, username);
        let key = self.get_encryption_key(&name).await?;
        if self.persist_encryption_key(&name, &key).await? {
            return Ok(key);
        }
        // Someone else won the race; use what is on disk.
        self.read_key(&name).await?.ok_or(Error::KeyfileNotFound)
    }

    /// Encrypt a password with the user's existing key file.
    pub async fn encipher_password(
        &self,
        tenant: &str,
        username: &str,
        plaintext: &str,
    ) -> Result<String> {
        let key = self.required_key(tenant, username).await?;
        let (ciphertext, _) = Self::encrypt(&key, plaintext)?;
        Ok(ciphertext)
    }

    pub async fn decipher_password(
        &self,
        tenant: &str,
        username: &str,
        ciphertext: &str,
    ) -> Result<String> {
        let key = self.required_key(tenant, username).await?;
        Self::decrypt(ciphertext, &key)
    }

    async fn required_key(&self, tenant: &str, username: &str) -> Result<EncryptionKey> {
        self.read_key(&Self::key_file_name(tenant, username))
            .await?
            .ok_or(Error::KeyfileNotFound)
    }

    async fn read_key(&self, file_name: &str) -> Result<Option<EncryptionKey>> {
        let path = self.key_dir.join(file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(Secret::new(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Crypto(format!("reading {}: {e}", path.display()))),
        }
    }
}

fn new_cipher(key: &EncryptionKey) -> Result<Aes256Gcm> {
    if key.expose().len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "encryption key must be {KEY_SIZE} bytes, got {}",
            key.expose().len()
        )));
    }
    Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| Error::Crypto(format!("invalid encryption key: {e}")))
}
