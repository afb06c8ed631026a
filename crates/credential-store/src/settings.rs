//! Per-profile secure settings (passwords, client secrets)
//!
//! Settings are addressed by their dotted name, e.g. `auth.client.secret`,
//! and stored under `config-{profile}-{name with . replaced by -}`.

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::CredentialStore;

/// Key prefix shared by every stored setting.
pub const SETTING_PREFIX: &str = "config";

/// Store key for `setting` in `profile`.
pub fn setting_key(profile: &str, setting: &str) -> String {
    format!("{SETTING_PREFIX}-{profile}-{}", setting.replace('.', "-"))
}

pub struct SecureSettings<'a> {
    store: &'a dyn CredentialStore,
    profile: &'a str,
}

impl<'a> SecureSettings<'a> {
    pub fn new(store: &'a dyn CredentialStore, profile: &'a str) -> Self {
        Self { store, profile }
    }

    /// Read a setting. Missing or empty values are `None`.
    pub async fn get(&self, setting: &str) -> Result<Option<String>> {
        if setting.is_empty() {
            return Err(Error::InvalidKey("setting name cannot be empty".into()));
        }
        let key = setting_key(self.profile, setting);
        let value = match self.store.get(&key).await? {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => return Ok(None),
            Some(other) => other.to_string(),
        };
        Ok((!value.is_empty()).then_some(value))
    }

    /// Write a setting. Only keychain-backed stores accept plaintext
    /// secrets.
    pub async fn put(&self, setting: &str, value: &str) -> Result<()> {
        if setting.is_empty() || value.is_empty() {
            return Err(Error::InvalidKey(
                "neither setting name nor value can be empty".into(),
            ));
        }
        let kind = self.store.kind();
        if !kind.is_secure() {
            return Err(Error::NotSecure(kind));
        }
        let key = setting_key(self.profile, setting);
        self.store.store_string(&key, value).await?;
        debug!(profile = self.profile, setting, "stored secure setting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileStore;
    use crate::kind::StoreKind;

    #[test]
    fn key_replaces_dots() {
        assert_eq!(
            setting_key("default", "auth.client.secret"),
            "config-default-auth-client-secret"
        );
        assert_eq!(setting_key("dev", "auth.password"), "config-dev-auth-password");
    }

    #[tokio::test]
    async fn get_reads_from_any_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .store_string("config-default-auth-client-secret", "cs")
            .await
            .unwrap();

        let settings = SecureSettings::new(&store, "default");
        assert_eq!(
            settings.get("auth.client.secret").await.unwrap().as_deref(),
            Some("cs")
        );
        assert!(settings.get("auth.password").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_refuses_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let settings = SecureSettings::new(&store, "default");
        let err = settings.put("auth.password", "pw").await.unwrap_err();
        assert!(matches!(err, Error::NotSecure(StoreKind::File)), "got: {err}");
    }

    #[tokio::test]
    async fn put_refuses_empty_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let settings = SecureSettings::new(&store, "default");
        assert!(matches!(
            settings.put("auth.password", "").await.unwrap_err(),
            Error::InvalidKey(_)
        ));
    }
}
