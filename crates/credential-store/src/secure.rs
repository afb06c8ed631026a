//! OS keychain backed store
//!
//! `SecureStore` handles JSON encoding and prefix wipes; the platform
//! specifics live behind `KeychainHelper`.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::kind::StoreKind;
use crate::{BoxFuture, CredentialStore, decode_payload, validate_key};

/// Raw string secrets in a platform keychain.
pub trait KeychainHelper: Send + Sync {
    fn kind(&self) -> StoreKind;

    fn add<'a>(&'a self, key: &'a str, secret: &'a str) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Keys owned by this tool that start with `prefix`. Foreign keychain
    /// entries are never returned.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
}

pub struct SecureStore<H> {
    helper: H,
}

impl<H: KeychainHelper> SecureStore<H> {
    pub fn new(helper: H) -> Self {
        Self { helper }
    }
}

impl<H: KeychainHelper> CredentialStore for SecureStore<H> {
    fn kind(&self) -> StoreKind {
        self.helper.kind()
    }

    fn store<'a>(&'a self, key: &'a str, value: &'a Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            validate_key(key)?;
            let payload = match value {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other)
                    .map_err(|e| Error::Serialization(format!("encoding {key}: {e}")))?,
            };
            self.helper.add(key, &payload).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            validate_key(key)?;
            Ok(self.helper.get(key).await?.map(|raw| decode_payload(&raw)))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            validate_key(key)?;
            self.helper.delete(key).await
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut keys = self.helper.list(prefix).await?;
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }
}
