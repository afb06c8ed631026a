//! Vault endpoint defaults and token lifetime rules

use std::time::Duration;

/// Vault cloud domain used when none is configured.
pub const DEFAULT_DOMAIN: &str = "secretsvaultcloud.com";

pub const DEFAULT_SCHEME: &str = "https";

pub const DEFAULT_API_VERSION: &str = "v1";

/// Profile used when none is selected.
pub const DEFAULT_PROFILE: &str = "default";

/// Token endpoint path, relative to the API root.
pub const TOKEN_PATH: &str = "token";

pub const CERT_AUTH_PATH: &str = "certificate/auth";

pub const OIDC_AUTH_PATH: &str = "oidc/auth";

/// Safety margin subtracted from a token's lifetime before it is considered
/// expired.
pub const TOKEN_LEEWAY_SECS: i64 = 10;

/// How long after issue a refresh token is still tried. Fixed client-side;
/// the server does not advertise a refresh TTL.
pub const REFRESH_WINDOW_HOURS: i64 = 720;

/// Prefix of every cached token key.
pub const TOKEN_KEY_PREFIX: &str = "token";

/// Local callback address for browser logins.
pub const DEFAULT_CALLBACK: &str = "localhost:8072";

/// How long to wait for the browser to hit the callback.
pub const OIDC_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Secure setting holding a plaintext password (keychain stores).
pub const SETTING_PASSWORD: &str = "auth.password";

/// Secure setting holding the AES-GCM encrypted password (file stores).
pub const SETTING_SECURE_PASSWORD: &str = "auth.securePassword";

pub const SETTING_CLIENT_SECRET: &str = "auth.client.secret";
