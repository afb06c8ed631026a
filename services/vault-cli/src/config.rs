//! Configuration types and loading
//!
//! Precedence: CLI flags > env vars > config file > defaults.
//! The client secret is never read from the file; it comes from
//! VAULTCTL_AUTH_CLIENT_SECRET or the credential store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use credential_store::{StoreKind, StoreOptions};
use serde::Deserialize;
use vault_auth::constants::{
    DEFAULT_API_VERSION, DEFAULT_CALLBACK, DEFAULT_DOMAIN, DEFAULT_PROFILE, DEFAULT_SCHEME,
    OIDC_CALLBACK_TIMEOUT,
};
use vault_auth::{AuthSettings, Browser, GcpAuthType, GcpSettings, VaultEndpoint};

use crate::cli::Overrides;

pub const CONFIG_DIR_NAME: &str = ".vaultctl";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Root configuration: one table per profile.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub tenant: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// `file`, `none`, `pass_linux` or `wincred`.
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default, rename = "type")]
    pub method: String,
    #[serde(default)]
    pub username: String,
    /// Plaintext password. Prefer `auth set-password`.
    #[serde(default)]
    pub password: Option<Secret<String>>,
    /// Password encrypted with the user's key file.
    #[serde(default)]
    pub secure_password: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub private_key: Option<Secret<String>>,
    #[serde(default = "default_callback")]
    pub callback: String,
    #[serde(default)]
    pub aws_profile: Option<String>,
    /// OIDC callback wait in seconds.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    #[serde(default)]
    pub skip_cache: bool,
    #[serde(default)]
    pub gcp: GcpConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcpConfig {
    /// `gce` (default) or `iam`.
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub token: Option<Secret<String>>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_owned()
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_owned()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_owned()
}

fn default_callback() -> String {
    DEFAULT_CALLBACK.to_owned()
}

fn default_callback_timeout() -> u64 {
    OIDC_CALLBACK_TIMEOUT.as_secs()
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            domain: default_domain(),
            scheme: default_scheme(),
            port: None,
            api_version: default_api_version(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: String::new(),
            username: String::new(),
            password: None,
            secure_password: None,
            provider: String::new(),
            client_id: String::new(),
            client_secret: None,
            refresh_token: None,
            certificate: String::new(),
            private_key: None,
            callback: default_callback(),
            aws_profile: None,
            callback_timeout_secs: default_callback_timeout(),
            skip_cache: false,
            gcp: GcpConfig::default(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// `--config`, then VAULTCTL_CONFIG, then `~/.vaultctl/config.toml`.
    pub fn resolve_path(cli_path: Option<&str>) -> common::Result<PathBuf> {
        if let Some(p) = cli_path {
            return Ok(PathBuf::from(p));
        }
        if let Some(p) = non_empty_env("VAULTCTL_CONFIG") {
            return Ok(PathBuf::from(p));
        }
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .ok_or_else(|| common::Error::Config("cannot determine home directory".into()))
    }

    /// `--profile`, then VAULTCTL_PROFILE, then `default`.
    pub fn resolve_profile(cli_profile: Option<&str>) -> String {
        cli_profile
            .map(str::to_owned)
            .or_else(|| non_empty_env("VAULTCTL_PROFILE"))
            .unwrap_or_else(|| DEFAULT_PROFILE.to_owned())
    }

    /// Settings of `name`. Without any profiles on file the default
    /// profile starts empty so env vars and flags can fill it.
    pub fn profile(&self, name: &str) -> common::Result<ProfileConfig> {
        match self.profiles.get(name) {
            Some(profile) => Ok(profile.clone()),
            None if name == DEFAULT_PROFILE => Ok(ProfileConfig::default()),
            None => Err(common::Error::UnknownProfile(name.to_owned())),
        }
    }
}

impl ProfileConfig {
    /// Overlay VAULTCTL_TENANT, VAULTCTL_AUTH_PASSWORD and
    /// VAULTCTL_AUTH_CLIENT_SECRET.
    pub fn apply_env(&mut self) {
        if let Some(tenant) = non_empty_env("VAULTCTL_TENANT") {
            self.tenant = tenant;
        }
        if let Some(password) = non_empty_env("VAULTCTL_AUTH_PASSWORD") {
            self.auth.password = Some(Secret::new(password));
        }
        if let Some(secret) = non_empty_env("VAULTCTL_AUTH_CLIENT_SECRET") {
            self.auth.client_secret = Some(Secret::new(secret));
        }
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(tenant) = &overrides.tenant {
            self.tenant = tenant.clone();
        }
        if let Some(method) = &overrides.auth_type {
            self.auth.method = method.clone();
        }
        if let Some(username) = &overrides.username {
            self.auth.username = username.clone();
        }
        if let Some(password) = &overrides.password {
            self.auth.password = Some(Secret::new(password.clone()));
        }
        if let Some(provider) = &overrides.provider {
            self.auth.provider = provider.clone();
        }
        if overrides.no_cache {
            self.auth.skip_cache = true;
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.tenant.trim().is_empty() {
            return Err(common::Error::Config(
                "tenant must be set (config, VAULTCTL_TENANT or --tenant)".into(),
            ));
        }
        if self.domain.contains("://") {
            return Err(common::Error::Config(format!(
                "domain must not include a scheme, got: {}",
                self.domain
            )));
        }
        if self.scheme != "https" && self.scheme != "http" {
            return Err(common::Error::Config(format!(
                "scheme must be http or https, got: {}",
                self.scheme
            )));
        }
        self.gcp_auth_type()?;
        self.store_options()?;
        Ok(())
    }

    pub fn store_options(&self) -> common::Result<StoreOptions> {
        let kind: StoreKind = self
            .store
            .kind
            .parse()
            .map_err(|e: credential_store::Error| common::Error::Config(e.to_string()))?;
        let mut options = StoreOptions::new(kind);
        if let Some(path) = &self.store.path {
            options = options.with_path(path.clone());
        }
        Ok(options)
    }

    pub fn endpoint(&self) -> VaultEndpoint {
        VaultEndpoint::new(&self.tenant)
            .with_domain(&self.domain)
            .with_scheme(&self.scheme)
            .with_port(self.port)
            .with_api_version(&self.api_version)
    }

    fn gcp_auth_type(&self) -> common::Result<GcpAuthType> {
        self.auth
            .gcp
            .kind
            .parse()
            .map_err(|e: vault_auth::Error| common::Error::Config(e.to_string()))
    }

    pub fn auth_settings(&self, profile: &str, browser: Browser) -> common::Result<AuthSettings> {
        let auth = &self.auth;
        Ok(AuthSettings {
            method: auth.method.clone(),
            tenant: self.tenant.clone(),
            profile: profile.to_owned(),
            username: auth.username.clone(),
            password: auth.password.clone(),
            secure_password: auth.secure_password.clone(),
            provider: auth.provider.clone(),
            client_id: auth.client_id.clone(),
            client_secret: auth.client_secret.clone(),
            refresh_token: auth.refresh_token.clone(),
            certificate: auth.certificate.clone(),
            private_key: auth.private_key.clone(),
            callback: auth.callback.clone(),
            aws_profile: auth.aws_profile.clone(),
            gcp: GcpSettings {
                token: auth.gcp.token.clone(),
                auth_type: self.gcp_auth_type()?,
                service_account: auth.gcp.service.clone(),
                project: auth.gcp.project.clone(),
                credentials_file: auth.gcp.credentials_file.clone(),
            },
            skip_cache: auth.skip_cache,
            oidc_timeout: Duration::from_secs(auth.callback_timeout_secs),
            browser,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_overlay_env() {
        for key in [
            "VAULTCTL_TENANT",
            "VAULTCTL_AUTH_PASSWORD",
            "VAULTCTL_AUTH_CLIENT_SECRET",
            "VAULTCTL_PROFILE",
            "VAULTCTL_CONFIG",
        ] {
            unsafe { remove_env(key) };
        }
    }

    fn valid_toml() -> &'static str {
        r#"
[profiles.default]
tenant = "acme"

[profiles.default.auth]
type = "password"
username = "alice"

[profiles.staging]
tenant = "acme-staging"
domain = "secretsvaultcloud.eu"
port = 8443

[profiles.staging.store]
type = "none"

[profiles.staging.auth]
type = "gcp"
client_secret = "ignored"

[profiles.staging.auth.gcp]
type = "iam"
service = "builder@proj-1.iam.gserviceaccount.com"
project = "proj-1"
"#
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_profiles() {
        let (_dir, path) = write_config(valid_toml());
        let config = Config::load(&path).unwrap();

        let default = config.profile("default").unwrap();
        assert_eq!(default.tenant, "acme");
        assert_eq!(default.domain, DEFAULT_DOMAIN);
        assert_eq!(default.auth.username, "alice");
        assert_eq!(default.auth.callback, DEFAULT_CALLBACK);
        assert_eq!(default.store_options().unwrap().kind, StoreKind::File);
        default.validate().unwrap();

        let staging = config.profile("staging").unwrap();
        assert_eq!(staging.port, Some(8443));
        assert_eq!(staging.store_options().unwrap().kind, StoreKind::None);
        assert!(staging.auth.client_secret.is_none());
        assert_eq!(
            staging.endpoint().url("token"),
            "https://acme-staging.secretsvaultcloud.eu:8443/v1/token"
        );

        let settings = staging.auth_settings("staging", Browser::Disabled).unwrap();
        assert_eq!(settings.gcp.auth_type, GcpAuthType::Iam);
        assert_eq!(settings.gcp.project.as_deref(), Some("proj-1"));
        assert_eq!(settings.profile, "staging");
    }

    #[test]
    fn test_unknown_profile() {
        let (_dir, path) = write_config(valid_toml());
        let config = Config::load(&path).unwrap();
        let err = config.profile("prod").unwrap_err();
        assert_eq!(err.to_string(), "unknown profile: prod");
    }

    #[test]
    fn test_default_profile_without_file() {
        let profile = Config::default().profile(DEFAULT_PROFILE).unwrap();
        assert!(profile.tenant.is_empty());
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let (_dir, path) = write_config("not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_env_overlay() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlay_env();
        let (_dir, path) = write_config(valid_toml());
        let mut profile = Config::load(&path).unwrap().profile("default").unwrap();

        unsafe { set_env("VAULTCTL_TENANT", "acme-env") };
        unsafe { set_env("VAULTCTL_AUTH_PASSWORD", "env-pass") };
        unsafe { set_env("VAULTCTL_AUTH_CLIENT_SECRET", "env-secret") };
        profile.apply_env();
        clear_overlay_env();

        assert_eq!(profile.tenant, "acme-env");
        assert_eq!(profile.auth.password.as_ref().unwrap().expose(), "env-pass");
        assert_eq!(
            profile.auth.client_secret.as_ref().unwrap().expose(),
            "env-secret"
        );
    }

    #[test]
    fn test_flags_beat_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlay_env();
        let mut profile = ProfileConfig::default();

        unsafe { set_env("VAULTCTL_TENANT", "acme-env") };
        profile.apply_env();
        clear_overlay_env();
        profile.apply_overrides(&Overrides {
            tenant: Some("acme-flag".into()),
            auth_type: Some("clientcred".into()),
            no_cache: true,
            ..Default::default()
        });

        assert_eq!(profile.tenant, "acme-flag");
        assert_eq!(profile.auth.method, "clientcred");
        assert!(profile.auth.skip_cache);
    }

    #[test]
    fn test_resolve_path_and_profile() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overlay_env();

        assert_eq!(
            Config::resolve_path(Some("/tmp/custom.toml")).unwrap(),
            PathBuf::from("/tmp/custom.toml")
        );
        unsafe { set_env("VAULTCTL_CONFIG", "/etc/vaultctl.toml") };
        assert_eq!(
            Config::resolve_path(None).unwrap(),
            PathBuf::from("/etc/vaultctl.toml")
        );

        assert_eq!(Config::resolve_profile(None), DEFAULT_PROFILE);
        unsafe { set_env("VAULTCTL_PROFILE", "staging") };
        assert_eq!(Config::resolve_profile(None), "staging");
        assert_eq!(Config::resolve_profile(Some("prod")), "prod");

        clear_overlay_env();
    }

    #[test]
    fn test_validation_errors() {
        let mut profile = ProfileConfig {
            tenant: "acme".into(),
            domain: "https://secretsvaultcloud.com".into(),
            ..Default::default()
        };
        let err = profile.validate().unwrap_err();
        assert!(err.to_string().contains("must not include a scheme"), "got: {err}");

        profile.domain = DEFAULT_DOMAIN.into();
        profile.store.kind = "vault".into();
        assert!(profile.validate().is_err());

        profile.store.kind = "file".into();
        profile.auth.gcp.kind = "gke".into();
        let err = profile.validate().unwrap_err();
        assert!(err.to_string().contains("invalid GCP auth type"), "got: {err}");
    }
}
