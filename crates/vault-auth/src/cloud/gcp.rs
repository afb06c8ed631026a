//! GCP identity tokens
//!
//! `gce` asks the metadata server for an identity token for the attached
//! service account. `iam` uses Application Default Credentials to have the
//! IAM API sign a JWT on behalf of a service account. A `gce` failure falls
//! back to `iam` so workstation logins work with the same settings.
//!
//! Default credentials for `iam` are looked up like gcloud does: the
//! configured file, `GOOGLE_APPLICATION_CREDENTIALS`, the gcloud well-known
//! file, and finally the metadata server's access token.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use common::Secret;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::encode_query_value;
use crate::error::{Error, Result};
use crate::grant::GrantRequest;

pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
pub const DEFAULT_IAM_BASE: &str = "https://iam.googleapis.com";
pub const DEFAULT_OAUTH_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const GOOGLE_ISSUER: &str = "https://accounts.google.com";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";
const ADC_FILE_NAME: &str = "application_default_credentials.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GcpAuthType {
    #[default]
    Gce,
    Iam,
}

impl FromStr for GcpAuthType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "gce" => Ok(GcpAuthType::Gce),
            "iam" => Ok(GcpAuthType::Iam),
            other => Err(Error::Config(format!("invalid GCP auth type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcpSettings {
    /// Pre-obtained identity token; skips every lookup.
    pub token: Option<Secret<String>>,
    pub auth_type: GcpAuthType,
    /// Service account email; `default` on GCE, from ADC for `iam`.
    pub service_account: Option<String>,
    pub project: Option<String>,
    /// ADC file; `GOOGLE_APPLICATION_CREDENTIALS` or the gcloud default
    /// when unset.
    pub credentials_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GcpEndpoints {
    pub metadata_host: String,
    pub iam_base: String,
    /// Token endpoint for `authorized_user` refresh tokens.
    pub oauth_token_uri: String,
}

impl Default for GcpEndpoints {
    fn default() -> Self {
        Self {
            metadata_host: DEFAULT_METADATA_HOST.to_owned(),
            iam_base: DEFAULT_IAM_BASE.to_owned(),
            oauth_token_uri: DEFAULT_OAUTH_TOKEN_URI.to_owned(),
        }
    }
}

impl GcpEndpoints {
    /// Defaults with `GCE_METADATA_HOST` applied.
    pub fn from_env() -> Self {
        let mut endpoints = Self::default();
        if let Some(host) = std::env::var("GCE_METADATA_HOST")
            .ok()
            .filter(|h| !h.is_empty())
        {
            endpoints.metadata_host = host;
        }
        endpoints
    }
}

/// Application Default Credentials file contents.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AdcCredentials {
    ServiceAccount {
        client_email: String,
        private_key: Secret<String>,
        #[serde(default)]
        project_id: Option<String>,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: Secret<String>,
        refresh_token: Secret<String>,
        #[serde(default)]
        quota_project_id: Option<String>,
    },
}

fn default_token_uri() -> String {
    DEFAULT_OAUTH_TOKEN_URI.to_owned()
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct IdentityClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    sub: &'a str,
    email: &'a str,
    sub_type: &'a str,
    project_id: &'a str,
}

#[derive(Serialize)]
struct SignJwtRequest {
    payload: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignJwtResponse {
    signed_jwt: String,
}

impl AdcCredentials {
    async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read(path).await.map_err(|e| {
            Error::CloudIdentity(format!(
                "reading application default credentials {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_slice(&contents).map_err(|e| {
            Error::CloudIdentity(format!(
                "parsing application default credentials {}: {e}",
                path.display()
            ))
        })
    }

    /// The file's `type`, carried as `sub_type` in the identity payload.
    fn account_type(&self) -> &'static str {
        match self {
            AdcCredentials::ServiceAccount { .. } => "service_account",
            AdcCredentials::AuthorizedUser { .. } => "authorized_user",
        }
    }

    fn client_email(&self) -> Option<&str> {
        match self {
            AdcCredentials::ServiceAccount { client_email, .. } => Some(client_email),
            AdcCredentials::AuthorizedUser { .. } => None,
        }
    }

    fn project_id(&self) -> Option<&str> {
        match self {
            AdcCredentials::ServiceAccount { project_id, .. } => project_id.as_deref(),
            AdcCredentials::AuthorizedUser {
                quota_project_id, ..
            } => quota_project_id.as_deref(),
        }
    }

    /// OAuth access token with the cloud-platform scope.
    async fn access_token(
        &self,
        http: &reqwest::Client,
        endpoints: &GcpEndpoints,
    ) -> Result<String> {
        let request = match self {
            AdcCredentials::ServiceAccount {
                client_email,
                private_key,
                token_uri,
                ..
            } => {
                let assertion = service_account_assertion(client_email, private_key, token_uri)?;
                http.post(token_uri.as_str()).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            }
            AdcCredentials::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                ..
            } => http.post(endpoints.oauth_token_uri.as_str()).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose().as_str()),
                ("refresh_token", refresh_token.expose().as_str()),
            ]),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::CloudIdentity(format!("GCP token request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::CloudIdentity(format!(
                "GCP token endpoint returned {status}: {body}"
            )));
        }
        let token: AccessTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::CloudIdentity(format!("invalid GCP token response: {e}")))?;
        Ok(token.access_token)
    }
}

/// Metadata server GET returning the body on success.
async fn metadata_get(
    http: &reqwest::Client,
    endpoints: &GcpEndpoints,
    path: &str,
) -> Result<String> {
    let response = http
        .get(format!("http://{}/computeMetadata/v1/{path}", endpoints.metadata_host))
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| Error::CloudIdentity(format!("metadata request failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::CloudIdentity(format!(
            "metadata request {path} failed. Status: {}",
            status.as_u16()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| Error::CloudIdentity(format!("reading metadata response: {e}")))
}

/// Access token of the instance's default service account, used when no
/// credentials file exists.
async fn metadata_access_token(
    http: &reqwest::Client,
    endpoints: &GcpEndpoints,
) -> Result<String> {
    let body = metadata_get(http, endpoints, "instance/service-accounts/default/token").await?;
    let token: AccessTokenResponse = serde_json::from_str(&body)
        .map_err(|e| Error::CloudIdentity(format!("invalid metadata token response: {e}")))?;
    Ok(token.access_token)
}

/// RS256 JWT-bearer assertion for a service account key.
fn service_account_assertion(
    client_email: &str,
    private_key: &Secret<String>,
    token_uri: &str,
) -> Result<String> {
    let key = EncodingKey::from_rsa_pem(private_key.expose().as_bytes())
        .map_err(|e| Error::CloudIdentity(format!("invalid service account key: {e}")))?;
    let iat = Utc::now().timestamp();
    let claims = AssertionClaims {
        iss: client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: token_uri,
        iat,
        exp: iat + 3600,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| Error::CloudIdentity(format!("signing service account assertion: {e}")))
}

/// Where gcloud writes `auth application-default login` credentials:
/// `%APPDATA%\gcloud` on Windows, `~/.config/gcloud` elsewhere.
fn well_known_adc_path() -> Option<PathBuf> {
    #[cfg(windows)]
    let dir = std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .or_else(dirs::config_dir);
    #[cfg(not(windows))]
    let dir = dirs::home_dir().map(|home| home.join(".config"));
    dir.map(|dir| dir.join("gcloud").join(ADC_FILE_NAME))
}

/// The configured file, then `env_file`, then the well-known file if it
/// exists. `None` means the metadata server is the credential source.
fn adc_file(
    configured: Option<&Path>,
    env_file: Option<PathBuf>,
    well_known: Option<PathBuf>,
) -> Option<PathBuf> {
    configured
        .map(Path::to_path_buf)
        .or(env_file)
        .or_else(|| well_known.filter(|path| path.is_file()))
}

async fn default_credentials(settings: &GcpSettings) -> Result<Option<AdcCredentials>> {
    let env_file = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);
    match adc_file(
        settings.credentials_file.as_deref(),
        env_file,
        well_known_adc_path(),
    ) {
        Some(path) => {
            debug!(path = %path.display(), "using application default credentials file");
            AdcCredentials::load(&path).await.map(Some)
        }
        None => {
            debug!("no application default credentials file, using metadata server");
            Ok(None)
        }
    }
}

/// Identity token from the GCE metadata server.
pub async fn metadata_identity(
    http: &reqwest::Client,
    endpoints: &GcpEndpoints,
    service_account: Option<&str>,
    audience: &str,
) -> Result<String> {
    let account = service_account.unwrap_or(DEFAULT_SERVICE_ACCOUNT);
    debug!(service_account = %account, "requesting identity token from metadata server");
    let token = metadata_get(
        http,
        endpoints,
        &format!(
            "instance/service-accounts/{account}/identity?audience={}&format=full",
            encode_query_value(audience),
        ),
    )
    .await?;
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::CloudIdentity("metadata server returned an empty token".into()));
    }
    Ok(token.to_owned())
}

/// Identity JWT signed by the IAM API for a service account.
pub async fn iam_identity(
    http: &reqwest::Client,
    endpoints: &GcpEndpoints,
    settings: &GcpSettings,
    audience: &str,
) -> Result<String> {
    let creds = default_credentials(settings).await?;
    iam_identity_with(http, endpoints, settings, creds.as_ref(), audience).await
}

async fn iam_identity_with(
    http: &reqwest::Client,
    endpoints: &GcpEndpoints,
    settings: &GcpSettings,
    creds: Option<&AdcCredentials>,
    audience: &str,
) -> Result<String> {
    let account_email = creds.and_then(AdcCredentials::client_email).unwrap_or("");
    let account_type = creds.map(AdcCredentials::account_type).unwrap_or("");

    let service_account = settings
        .service_account
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(Some(account_email).filter(|e| !e.is_empty()))
        .ok_or_else(|| {
            Error::CloudIdentity("did not find service account identifier (email or uniqueId)".into())
        })?;

    let project = match settings
        .project
        .as_deref()
        .or_else(|| creds.and_then(AdcCredentials::project_id))
    {
        Some(project) => project.to_owned(),
        None if creds.is_none() => metadata_get(http, endpoints, "project/project-id")
            .await?
            .trim()
            .to_owned(),
        None => {
            return Err(Error::CloudIdentity(
                "GCP project id is required for iam auth".into(),
            ));
        }
    };

    let access_token = match creds {
        Some(creds) => creds.access_token(http, endpoints).await?,
        None => metadata_access_token(http, endpoints).await?,
    };

    let payload = serde_json::to_string(&IdentityClaims {
        iss: GOOGLE_ISSUER,
        aud: audience,
        sub: service_account,
        email: account_email,
        sub_type: account_type,
        project_id: &project,
    })
    .map_err(|e| Error::CloudIdentity(format!("encoding JWT payload: {e}")))?;

    debug!(service_account = %service_account, project = %project, "requesting IAM signed JWT");
    let response = http
        .post(format!(
            "{}/v1/projects/{project}/serviceAccounts/{service_account}:signJwt",
            endpoints.iam_base
        ))
        .bearer_auth(access_token)
        .json(&SignJwtRequest { payload })
        .send()
        .await
        .map_err(|e| Error::CloudIdentity(format!("signJwt request failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::CloudIdentity(format!(
            "signJwt returned {status}: {body}"
        )));
    }
    let signed: SignJwtResponse = response
        .json()
        .await
        .map_err(|e| Error::CloudIdentity(format!("invalid signJwt response: {e}")))?;
    Ok(signed.signed_jwt)
}

/// Resolve the identity token for `audience` per `settings`.
pub async fn identity_token(
    http: &reqwest::Client,
    endpoints: &GcpEndpoints,
    settings: &GcpSettings,
    audience: &str,
) -> Result<String> {
    if let Some(token) = settings.token.as_ref().filter(|t| !t.is_empty()) {
        debug!("using configured GCP identity token");
        return Ok(token.expose().clone());
    }

    let gce_error = match settings.auth_type {
        GcpAuthType::Gce => {
            match metadata_identity(http, endpoints, settings.service_account.as_deref(), audience)
                .await
            {
                Ok(token) => return Ok(token),
                Err(e) => {
                    warn!(error = %e, "GCE metadata identity unavailable, trying IAM");
                    Some(e)
                }
            }
        }
        GcpAuthType::Iam => None,
    };

    match iam_identity(http, endpoints, settings, audience).await {
        Ok(token) => Ok(token),
        Err(iam_error) => match gce_error {
            Some(gce_error) => Err(Error::CloudIdentity(format!(
                "gce: {gce_error}; iam: {iam_error}"
            ))),
            None => Err(iam_error),
        },
    }
}

/// Build the `gcp` grant with the vault origin as audience.
pub async fn build_grant(
    http: &reqwest::Client,
    settings: &GcpSettings,
    audience: &str,
) -> Result<GrantRequest> {
    let jwt = identity_token(http, &GcpEndpoints::from_env(), settings, audience).await?;
    Ok(GrantRequest::Gcp { jwt })
}
