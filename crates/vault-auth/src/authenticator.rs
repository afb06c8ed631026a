//! Token acquisition: cache, refresh, then a fresh login
//!
//! `Authenticator::get_token` walks a fixed sequence per call:
//!
//! 1. Cache lookup (skipped with `skip_cache`). A valid access token is
//!    returned without touching the network.
//! 2. A cached refresh token inside its window is exchanged first. Failure
//!    is logged and falls through.
//! 3. The configured method builds its grant, which is validated before
//!    any request goes out, then exchanged at `/token`.
//! 4. The new record is persisted under the cache key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::Secret;
use credential_store::{CredentialStore, SecureSettings, setting_key};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::cache::{TokenCache, cache_key};
use crate::cert::answer_challenge;
use crate::cipher::SecretCipher;
use crate::client::VaultClient;
use crate::cloud::gcp::GcpSettings;
use crate::cloud::{aws, azure, gcp};
use crate::constants::{
    DEFAULT_CALLBACK, DEFAULT_PROFILE, OIDC_CALLBACK_TIMEOUT, SETTING_CLIENT_SECRET,
    SETTING_PASSWORD, SETTING_SECURE_PASSWORD, TOKEN_PATH,
};
use crate::error::{Error, Result};
use crate::grant::GrantRequest;
use crate::method::AuthMethod;
use crate::oidc::{Browser, OidcLogin, authorize};
use crate::token::TokenRecord;

const THY_ONE_PROVIDER: &str = "thy-one";
const THY_ONE_DISPLAY_NAME: &str = "Thy-One";

/// Everything a login may need, already merged from flags, environment
/// and config file.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// `auth.type`; empty means password.
    pub method: String,
    pub tenant: String,
    pub profile: String,
    pub username: String,
    pub password: Option<Secret<String>>,
    /// Encrypted password from the config file.
    pub secure_password: Option<String>,
    pub provider: String,
    pub client_id: String,
    /// Only from the environment; otherwise read from the store.
    pub client_secret: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
    /// Base64 client certificate.
    pub certificate: String,
    /// Base64 PEM private key for the certificate.
    pub private_key: Option<Secret<String>>,
    pub callback: String,
    pub aws_profile: Option<String>,
    pub gcp: GcpSettings,
    /// Never read or write the token cache.
    pub skip_cache: bool,
    pub oidc_timeout: Duration,
    pub browser: Browser,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            method: String::new(),
            tenant: String::new(),
            profile: DEFAULT_PROFILE.to_owned(),
            username: String::new(),
            password: None,
            secure_password: None,
            provider: String::new(),
            client_id: String::new(),
            client_secret: None,
            refresh_token: None,
            certificate: String::new(),
            private_key: None,
            callback: DEFAULT_CALLBACK.to_owned(),
            aws_profile: None,
            gcp: GcpSettings::default(),
            skip_cache: false,
            oidc_timeout: OIDC_CALLBACK_TIMEOUT,
            browser: Browser::System,
        }
    }
}

fn secret_or_empty(secret: &Option<Secret<String>>) -> String {
    secret
        .as_ref()
        .map(|s| s.expose().clone())
        .unwrap_or_default()
}

pub struct Authenticator {
    client: VaultClient,
    store: Arc<dyn CredentialStore>,
    cache: TokenCache,
    cipher: SecretCipher,
    settings: AuthSettings,
}

impl Authenticator {
    pub fn new(
        client: VaultClient,
        store: Arc<dyn CredentialStore>,
        cipher: SecretCipher,
        settings: AuthSettings,
    ) -> Self {
        Self {
            client,
            cache: TokenCache::new(store.clone()),
            store,
            cipher,
            settings,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    /// A usable token for the configured method, from cache or the vault.
    pub async fn get_token(&self) -> Result<TokenRecord> {
        let span = info_span!(
            "get_token",
            invocation = %Uuid::new_v4(),
            auth_type = %self.settings.method,
            tenant = %self.settings.tenant,
            profile = %self.settings.profile,
        );
        self.resolve_token().instrument(span).await
    }

    async fn resolve_token(&self) -> Result<TokenRecord> {
        let method: AuthMethod = self.settings.method.parse()?;
        let key = (!self.settings.skip_cache)
            .then(|| cache_key(method, &self.settings.tenant, &self.settings.profile));

        if let Some(key) = &key {
            match self.cache.load(key).await {
                None => debug!(state = "cache_miss", key = %key),
                Some(record) => {
                    let now = Utc::now();
                    if record.is_valid_at(now) {
                        debug!(
                            state = "cache_hit_valid",
                            expires_in = record.seconds_remaining(now),
                            "using cached token"
                        );
                        return Ok(record);
                    }
                    if record.refresh_window_open(now) {
                        debug!(state = "cache_hit_refreshable");
                        let grant = GrantRequest::RefreshToken {
                            refresh_token: record.refresh_token.clone(),
                        };
                        match self.exchange(method, &grant).await {
                            Ok(fresh) => {
                                self.cache.save(key, &fresh).await?;
                                debug!(state = "persisted", "refreshed token");
                                return Ok(fresh);
                            }
                            Err(e) => {
                                warn!(error = %e, "token refresh failed, authenticating again")
                            }
                        }
                    } else {
                        debug!(state = "cache_hit_stale");
                    }
                }
            }
        }

        debug!(state = "fresh_auth", method = %method);
        let grant = self.build_grant(method).await?;
        grant.validate()?;
        let record = self.exchange(method, &grant).await?;

        if let Some(key) = &key {
            self.cache.save(key, &record).await?;
            debug!(state = "persisted", key = %key);
        }
        info!(method = %method, "authenticated");
        Ok(record)
    }

    /// Delete every cached token of the active profile.
    pub async fn wipe_cached_tokens(&self) -> Result<usize> {
        self.cache.wipe_profile(&self.settings.profile).await
    }

    /// Every cached token key across profiles.
    pub async fn list_cached_tokens(&self) -> Result<Vec<String>> {
        self.cache.keys().await
    }

    /// Keep `password` for later password logins.
    ///
    /// Keychain stores hold it as a secure setting. Other stores hold it
    /// encrypted with the user's key file, which is created if needed.
    pub async fn save_password(&self, password: &str) -> Result<()> {
        if self.store.kind().is_secure() {
            SecureSettings::new(self.store.as_ref(), &self.settings.profile)
                .put(SETTING_PASSWORD, password)
                .await?;
            return Ok(());
        }
        if self.settings.username.trim().is_empty() {
            return Err(Error::missing(&["auth-username"]));
        }
        if password.is_empty() {
            return Err(Error::missing(&["auth-password"]));
        }
        self.cipher
            .provision_key(&self.settings.tenant, &self.settings.username)
            .await?;
        let ciphertext = self
            .cipher
            .encipher_password(&self.settings.tenant, &self.settings.username, password)
            .await?;
        let key = setting_key(&self.settings.profile, SETTING_SECURE_PASSWORD);
        self.store.store_string(&key, &ciphertext).await?;
        info!(profile = %self.settings.profile, "stored encrypted password");
        Ok(())
    }

    /// Store a secure setting (e.g. `auth.client.secret`) in the keychain.
    pub async fn save_secure_setting(&self, setting: &str, value: &str) -> Result<()> {
        SecureSettings::new(self.store.as_ref(), &self.settings.profile)
            .put(setting, value)
            .await?;
        Ok(())
    }

    async fn exchange(&self, method: AuthMethod, grant: &GrantRequest) -> Result<TokenRecord> {
        debug!(grant_type = grant.grant_type(), "requesting token");
        let failed = |reason: String| Error::AuthenticationFailed {
            method: method.as_str().to_owned(),
            reason,
        };
        let mut record: TokenRecord = match self.client.post_json(TOKEN_PATH, grant).await {
            Ok(record) => record,
            Err(Error::Rejected { body, .. }) => return Err(failed(body)),
            Err(Error::Protocol(reason)) => return Err(failed(reason)),
            Err(e) => return Err(e),
        };
        if record.access_token.is_empty() {
            return Err(failed("empty token in response".into()));
        }
        record.granted = Utc::now();
        Ok(record)
    }

    async fn build_grant(&self, method: AuthMethod) -> Result<GrantRequest> {
        let settings = &self.settings;
        match method {
            AuthMethod::Password => self.password_grant().await,
            AuthMethod::Refresh => {
                let refresh_token = secret_or_empty(&settings.refresh_token);
                if refresh_token.trim().is_empty() {
                    return Err(Error::missing(&["auth-refreshtoken"]));
                }
                Ok(GrantRequest::RefreshToken { refresh_token })
            }
            AuthMethod::ClientCredential => Ok(GrantRequest::ClientCredentials {
                client_id: settings.client_id.clone(),
                client_secret: self.client_secret().await?,
            }),
            AuthMethod::Certificate => {
                let private_key = secret_or_empty(&settings.private_key);
                let mut missing = Vec::new();
                if settings.certificate.trim().is_empty() {
                    missing.push("auth-certificate");
                }
                if private_key.trim().is_empty() {
                    missing.push("auth-private-key");
                }
                if !missing.is_empty() {
                    return Err(Error::missing(&missing));
                }
                let challenge =
                    answer_challenge(&self.client, &settings.certificate, &private_key).await?;
                Ok(GrantRequest::Certificate {
                    cert_challenge_id: challenge.challenge_id,
                    decrypted_challenge: challenge.decrypted,
                })
            }
            AuthMethod::FederatedThyOne => {
                let provider = if settings.provider.is_empty() {
                    THY_ONE_PROVIDER
                } else {
                    settings.provider.as_str()
                };
                authorize(&self.client, &self.oidc_login(provider, THY_ONE_DISPLAY_NAME)).await
            }
            AuthMethod::Oidc => {
                if settings.provider.trim().is_empty() {
                    return Err(Error::missing(&["auth-provider"]));
                }
                let login = self.oidc_login(&settings.provider, &settings.provider);
                authorize(&self.client, &login).await
            }
            AuthMethod::FederatedAws => {
                aws::build_grant(self.client.http(), settings.aws_profile.as_deref()).await
            }
            AuthMethod::FederatedAzure => azure::build_grant(self.client.http()).await,
            AuthMethod::FederatedGcp => {
                gcp::build_grant(
                    self.client.http(),
                    &settings.gcp,
                    &self.client.endpoint().audience(),
                )
                .await
            }
        }
    }

    fn oidc_login(&self, provider: &str, display_name: &str) -> OidcLogin {
        let mut login = OidcLogin::new(provider, display_name);
        if !self.settings.callback.is_empty() {
            login.callback = self.settings.callback.clone();
        }
        login.timeout = self.settings.oidc_timeout;
        login.browser = self.settings.browser;
        login
    }

    /// Plaintext setting first, then the keychain, then the encrypted
    /// password decrypted with the user's key file.
    async fn password_grant(&self) -> Result<GrantRequest> {
        let settings = &self.settings;
        let mut password = secret_or_empty(&settings.password);

        if password.is_empty() && !settings.username.trim().is_empty() {
            let secure = SecureSettings::new(self.store.as_ref(), &settings.profile);
            if self.store.kind().is_secure() {
                password = secure.get(SETTING_PASSWORD).await?.unwrap_or_default();
            } else {
                let encrypted = match &settings.secure_password {
                    Some(value) if !value.is_empty() => Some(value.clone()),
                    _ => secure.get(SETTING_SECURE_PASSWORD).await?,
                };
                if let Some(encrypted) = encrypted {
                    debug!("decrypting stored password");
                    password = self
                        .cipher
                        .decipher_password(&settings.tenant, &settings.username, &encrypted)
                        .await?;
                }
            }
        }

        Ok(GrantRequest::Password {
            username: settings.username.clone(),
            password,
            provider: settings.provider.clone(),
        })
    }

    async fn client_secret(&self) -> Result<String> {
        if let Some(secret) = self.settings.client_secret.as_ref().filter(|s| !s.is_empty()) {
            return Ok(secret.expose().clone());
        }
        SecureSettings::new(self.store.as_ref(), &self.settings.profile)
            .get(SETTING_CLIENT_SECRET)
            .await?
            .ok_or_else(|| Error::Config("auth-client-secret setting is empty".into()))
    }
}
