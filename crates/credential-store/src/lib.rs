//! Durable key → JSON storage for tokens and secure settings
//!
//! Keys are flat strings such as `token-password-acme-default` or
//! `config-default-auth-client-secret`. Every backend enumerates its keys by
//! prefix so callers can wipe a whole family of entries at once.
//!
//! Backends:
//! - `FileStore`: one 0600 file per key under `~/.vaultctl`
//! - `SecureStore`: OS keychain through a `KeychainHelper` (`pass`, Windows
//!   Credential Manager)
//! - `NoneStore`: accepts everything, remembers nothing
//!
//! A `StoreSelector` is built once at startup and handed to whoever needs a
//! store; the first backend it opens stays fixed for the process.

pub mod error;
pub mod file;
pub mod kind;
pub mod none;
pub mod pass;
pub mod secure;
pub mod selector;
pub mod settings;
#[cfg(windows)]
pub mod wincred;

pub use error::{Error, Result};
pub use file::FileStore;
pub use kind::StoreKind;
pub use none::NoneStore;
pub use pass::PassHelper;
pub use secure::{KeychainHelper, SecureStore};
pub use selector::{StoreOptions, StoreSelector};
pub use settings::{SecureSettings, setting_key};
#[cfg(windows)]
pub use wincred::WinCredHelper;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

/// Boxed future returned by store methods, kept dyn-compatible for
/// `Arc<dyn CredentialStore>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key → JSON blob storage.
///
/// Absence is not an error: `get` on a missing key returns `Ok(None)` and
/// `delete` on a missing key succeeds.
pub trait CredentialStore: Send + Sync {
    /// Backend kind, for logging and secure-setting checks.
    fn kind(&self) -> StoreKind;

    /// Write `value` under `key`, replacing any previous entry.
    fn store<'a>(&'a self, key: &'a str, value: &'a Value) -> BoxFuture<'a, Result<()>>;

    /// Read the entry under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Keys starting with `prefix`, sorted.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Store a bare string value.
    fn store_string<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let value = Value::String(value.to_owned());
            self.store(key, &value).await
        })
    }

    /// Delete every key starting with `prefix`.
    fn wipe<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for key in self.list(prefix).await? {
                self.delete(&key).await?;
            }
            Ok(())
        })
    }
}

/// Decode a stored payload. Entries written by other tools may be plain
/// text, which is surfaced as a JSON string.
pub(crate) fn decode_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Reject keys that would escape the store's namespace.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key is empty".into()));
    }
    if key.starts_with('.') || key.contains(['/', '\\']) {
        return Err(Error::InvalidKey(format!("{key:?} contains a path separator")));
    }
    Ok(())
}
