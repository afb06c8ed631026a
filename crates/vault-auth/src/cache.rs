//! Token cache on top of the credential store
//!
//! Keys look like `token-{method}-{tenant}-{profile}`. The profile is the
//! last `-` separated segment, so any `-` inside it is escaped as `%2D`.

use std::sync::Arc;

use credential_store::CredentialStore;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_PROFILE, TOKEN_KEY_PREFIX};
use crate::error::{Error, Result};
use crate::method::AuthMethod;
use crate::token::TokenRecord;

const DASH_ESCAPE: &str = "%2D";

pub fn escape_profile(profile: &str) -> String {
    let profile = if profile.is_empty() {
        DEFAULT_PROFILE
    } else {
        profile
    };
    profile.replace('-', DASH_ESCAPE)
}

pub fn unescape_key(key: &str) -> String {
    key.replace(DASH_ESCAPE, "-")
}

/// Cache key for a method, tenant and profile.
pub fn cache_key(method: AuthMethod, tenant: &str, profile: &str) -> String {
    format!(
        "{TOKEN_KEY_PREFIX}-{}-{tenant}-{}",
        method.cache_prefix(),
        escape_profile(profile)
    )
}

#[derive(Clone)]
pub struct TokenCache {
    store: Arc<dyn CredentialStore>,
}

impl TokenCache {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Cached record under `key`. Unreadable or empty entries count as a
    /// miss; the failure is logged, never returned.
    pub async fn load(&self, key: &str) -> Option<TokenRecord> {
        let value = match self.store.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "failed to read cached token");
                return None;
            }
        };
        match serde_json::from_value::<TokenRecord>(value) {
            Ok(record) if record.is_empty() => {
                debug!(key, "cached token is empty");
                None
            }
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "cached token is malformed");
                None
            }
        }
    }

    pub async fn save(&self, key: &str, record: &TokenRecord) -> Result<()> {
        let value = serde_json::to_value(record)
            .map_err(|e| Error::Protocol(format!("encoding token record: {e}")))?;
        self.store.store(key, &value).await?;
        debug!(key, "cached token");
        Ok(())
    }

    /// Delete every cached token whose profile segment equals `profile`.
    /// Returns how many entries were removed.
    pub async fn wipe_profile(&self, profile: &str) -> Result<usize> {
        let suffix = escape_profile(profile);
        let mut removed = 0;
        for key in self.store.list(TOKEN_KEY_PREFIX).await? {
            if key.rsplit_once('-').map(|(_, last)| last) == Some(suffix.as_str()) {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }
        debug!(profile, removed, "wiped cached tokens");
        Ok(removed)
    }

    /// Every cached token key, with profile escapes undone.
    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(TOKEN_KEY_PREFIX)
            .await?
            .iter()
            .map(|key| unescape_key(key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use credential_store::FileStore;

    fn record() -> TokenRecord {
        TokenRecord {
            access_token: "at".into(),
            token_type: "bearer".into(),
            expires_in: 3600,
            refresh_token: "rt".into(),
            granted: Utc::now(),
        }
    }

    #[test]
    fn key_format() {
        assert_eq!(
            cache_key(AuthMethod::Password, "acme", ""),
            "token-password-acme-default"
        );
        assert_eq!(
            cache_key(AuthMethod::Refresh, "acme", "dev"),
            "token-password-acme-dev"
        );
        assert_eq!(
            cache_key(AuthMethod::FederatedAws, "acme", "my-profile"),
            "token-aws-acme-my%2Dprofile"
        );
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(Arc::new(FileStore::new(dir.path())));
        let key = cache_key(AuthMethod::Password, "acme", "default");
        let token = record();

        cache.save(&key, &token).await.unwrap();
        assert_eq!(cache.load(&key).await, Some(token));
    }

    #[tokio::test]
    async fn malformed_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        store
            .store("token-password-acme-default", &serde_json::json!([1, 2, 3]))
            .await
            .unwrap();
        let cache = TokenCache::new(store);
        assert!(cache.load("token-password-acme-default").await.is_none());
    }

    #[tokio::test]
    async fn empty_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(Arc::new(FileStore::new(dir.path())));
        cache
            .save("token-password-acme-default", &TokenRecord::default())
            .await
            .unwrap();
        assert!(cache.load("token-password-acme-default").await.is_none());
    }

    #[tokio::test]
    async fn wipe_profile_leaves_other_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        let cache = TokenCache::new(store.clone());
        for key in [
            cache_key(AuthMethod::Password, "acme", "dev"),
            cache_key(AuthMethod::Certificate, "acme", "dev"),
            cache_key(AuthMethod::Password, "acme", "prod"),
            cache_key(AuthMethod::Password, "acme", "my-dev"),
        ] {
            cache.save(&key, &record()).await.unwrap();
        }
        store
            .store_string("config-dev-auth-password", "pw")
            .await
            .unwrap();

        let removed = cache.wipe_profile("dev").await.unwrap();
        assert_eq!(removed, 2);

        let remaining = cache.keys().await.unwrap();
        assert_eq!(
            remaining,
            vec!["token-password-acme-my-dev", "token-password-acme-prod"]
        );
        assert!(store.get("config-dev-auth-password").await.unwrap().is_some());
    }
}
