//! Azure managed identity / service principal bearer tokens
//!
//! The vault accepts an Azure Resource Manager access token as proof of
//! identity. Credentials come from the environment, first match wins:
//! - `AZURE_TENANT_ID` + `AZURE_CLIENT_ID` + `AZURE_CLIENT_SECRET`: service
//!   principal, client credentials flow
//! - `AZURE_TENANT_ID` + `AZURE_CLIENT_ID` + `AZURE_CERTIFICATE_PATH`: service
//!   principal signing a client assertion with a PEM certificate and key;
//!   `AZURE_CERTIFICATE_PASSWORD` unlocks an encrypted PKCS#8 key
//! - `AZURE_CLIENT_ID` + `AZURE_USERNAME` + `AZURE_PASSWORD`: resource owner
//!   password flow (`AZURE_TENANT_ID` defaults to `common`)
//! - `IDENTITY_ENDPOINT` + `IDENTITY_HEADER`: App Service managed identity
//! - otherwise: VM managed identity through IMDS (`AZURE_CLIENT_ID` selects
//!   a user-assigned identity)

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use common::Secret;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use super::encode_query_value;
use crate::error::{Error, Result};
use crate::grant::GrantRequest;

/// Resource the token is requested for.
pub const AZURE_RESOURCE: &str = "https://management.azure.com/";

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

pub const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const DEFAULT_TENANT: &str = "common";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 600;

/// Where the Azure identity comes from.
pub enum AzureSource {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: Secret<String>,
    },
    ClientCertificate {
        tenant_id: String,
        client_id: String,
        /// PEM file holding the certificate and its RSA private key.
        certificate_path: PathBuf,
        password: Option<Secret<String>>,
    },
    UsernamePassword {
        tenant_id: String,
        client_id: String,
        username: String,
        password: Secret<String>,
    },
    AppService {
        endpoint: String,
        header: Secret<String>,
    },
    Imds {
        client_id: Option<String>,
    },
}

impl AzureSource {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let tenant = var("AZURE_TENANT_ID");
        let client = var("AZURE_CLIENT_ID");

        if let (Some(tenant_id), Some(client_id)) = (&tenant, &client) {
            if let Some(secret) = var("AZURE_CLIENT_SECRET") {
                return AzureSource::ClientSecret {
                    tenant_id: tenant_id.clone(),
                    client_id: client_id.clone(),
                    client_secret: Secret::new(secret),
                };
            }
            if let Some(path) = var("AZURE_CERTIFICATE_PATH") {
                return AzureSource::ClientCertificate {
                    tenant_id: tenant_id.clone(),
                    client_id: client_id.clone(),
                    certificate_path: PathBuf::from(path),
                    password: var("AZURE_CERTIFICATE_PASSWORD").map(Secret::new),
                };
            }
        }
        if let (Some(client_id), Some(username), Some(password)) =
            (&client, var("AZURE_USERNAME"), var("AZURE_PASSWORD"))
        {
            return AzureSource::UsernamePassword {
                tenant_id: tenant.unwrap_or_else(|| DEFAULT_TENANT.to_owned()),
                client_id: client_id.clone(),
                username,
                password: Secret::new(password),
            };
        }
        if let (Some(endpoint), Some(header)) = (var("IDENTITY_ENDPOINT"), var("IDENTITY_HEADER")) {
            return AzureSource::AppService {
                endpoint,
                header: Secret::new(header),
            };
        }
        AzureSource::Imds { client_id: client }
    }
}

/// Token service locations, overridable for sovereign clouds and tests.
#[derive(Debug, Clone)]
pub struct AzureEndpoints {
    pub authority: String,
    pub imds: String,
}

impl Default for AzureEndpoints {
    fn default() -> Self {
        Self {
            authority: DEFAULT_AUTHORITY.to_owned(),
            imds: IMDS_TOKEN_ENDPOINT.to_owned(),
        }
    }
}

impl AzureEndpoints {
    /// Defaults with `AZURE_AUTHORITY_HOST` applied.
    pub fn from_env() -> Self {
        let mut endpoints = Self::default();
        if let Some(host) = std::env::var("AZURE_AUTHORITY_HOST")
            .ok()
            .filter(|h| !h.is_empty())
        {
            endpoints.authority = host.trim_end_matches('/').to_owned();
        }
        endpoints
    }

    fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{tenant_id}/oauth2/token", self.authority)
    }
}

#[derive(Deserialize)]
struct AzureTokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct ClientAssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    exp: i64,
}

/// Signing half of a certificate credential.
struct CertificateKey {
    /// Base64url SHA-1 of the certificate DER, sent as `x5t`.
    thumbprint: String,
    key: EncodingKey,
}

/// The complete `-----BEGIN {label}-----` block in `text`.
fn pem_block<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = text.find(&begin)?;
    let stop = start + text[start..].find(&end)? + end.len();
    Some(&text[start..stop])
}

fn pem_der(block: &str) -> Result<Vec<u8>> {
    let body: String = block
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .collect();
    STANDARD
        .decode(body)
        .map_err(|e| Error::CloudIdentity(format!("invalid certificate encoding: {e}")))
}

fn parse_certificate(
    contents: &[u8],
    path: &Path,
    password: Option<&Secret<String>>,
) -> Result<CertificateKey> {
    let text = std::str::from_utf8(contents)
        .ok()
        .filter(|text| text.contains("-----BEGIN "))
        .ok_or_else(|| {
            Error::CloudIdentity(format!(
                "{} is not a PEM file; convert PKCS#12 with `openssl pkcs12 -nodes`",
                path.display()
            ))
        })?;

    let certificate = pem_block(text, "CERTIFICATE").ok_or_else(|| {
        Error::CloudIdentity(format!("no certificate in {}", path.display()))
    })?;
    let thumbprint = URL_SAFE_NO_PAD.encode(Sha1::digest(pem_der(certificate)?));

    let key = if let Some(encrypted) = pem_block(text, "ENCRYPTED PRIVATE KEY") {
        let password = password.ok_or_else(|| {
            Error::CloudIdentity(format!(
                "AZURE_CERTIFICATE_PASSWORD is required for the encrypted key in {}",
                path.display()
            ))
        })?;
        let private =
            RsaPrivateKey::from_pkcs8_encrypted_pem(encrypted, password.expose().as_bytes())
                .map_err(|e| {
                    Error::CloudIdentity(format!("decrypting certificate key: {e}"))
                })?;
        let der = private
            .to_pkcs1_der()
            .map_err(|e| Error::CloudIdentity(format!("invalid certificate key: {e}")))?;
        EncodingKey::from_rsa_der(der.as_bytes())
    } else {
        let key_pem = pem_block(text, "PRIVATE KEY")
            .or_else(|| pem_block(text, "RSA PRIVATE KEY"))
            .ok_or_else(|| {
                Error::CloudIdentity(format!("no RSA private key in {}", path.display()))
            })?;
        EncodingKey::from_rsa_pem(key_pem.as_bytes())
            .map_err(|e| Error::CloudIdentity(format!("invalid certificate key: {e}")))?
    };

    Ok(CertificateKey { thumbprint, key })
}

/// RS256 client assertion for `client_id`, audience the tenant token URL.
fn client_assertion(
    certificate: &CertificateKey,
    client_id: &str,
    audience: &str,
) -> Result<String> {
    let mut header = Header::new(Algorithm::RS256);
    header.x5t = Some(certificate.thumbprint.clone());
    let now = Utc::now().timestamp();
    let claims = ClientAssertionClaims {
        aud: audience,
        iss: client_id,
        sub: client_id,
        jti: uuid::Uuid::new_v4().to_string(),
        nbf: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };
    jsonwebtoken::encode(&header, &claims, &certificate.key)
        .map_err(|e| Error::CloudIdentity(format!("signing client assertion: {e}")))
}

/// Fetch a management-plane access token for `source`.
pub async fn fetch_token(
    http: &reqwest::Client,
    source: &AzureSource,
    endpoints: &AzureEndpoints,
) -> Result<String> {
    let resource = encode_query_value(AZURE_RESOURCE);
    let request = match source {
        AzureSource::ClientSecret {
            tenant_id,
            client_id,
            client_secret,
        } => {
            debug!(tenant_id = %tenant_id, "requesting Azure token for service principal");
            http.post(endpoints.token_url(tenant_id)).form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose().as_str()),
                ("resource", AZURE_RESOURCE),
            ])
        }
        AzureSource::ClientCertificate {
            tenant_id,
            client_id,
            certificate_path,
            password,
        } => {
            debug!(
                tenant_id = %tenant_id,
                path = %certificate_path.display(),
                "requesting Azure token with client certificate"
            );
            let contents = tokio::fs::read(certificate_path).await.map_err(|e| {
                Error::CloudIdentity(format!(
                    "reading Azure certificate {}: {e}",
                    certificate_path.display()
                ))
            })?;
            let certificate = parse_certificate(&contents, certificate_path, password.as_ref())?;
            let token_url = endpoints.token_url(tenant_id);
            let assertion = client_assertion(&certificate, client_id, &token_url)?;
            http.post(token_url).form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                ("client_assertion", assertion.as_str()),
                ("resource", AZURE_RESOURCE),
            ])
        }
        AzureSource::UsernamePassword {
            tenant_id,
            client_id,
            username,
            password,
        } => {
            debug!(
                tenant_id = %tenant_id,
                username = %username,
                "requesting Azure token with password"
            );
            http.post(endpoints.token_url(tenant_id)).form(&[
                ("grant_type", "password"),
                ("client_id", client_id.as_str()),
                ("username", username.as_str()),
                ("password", password.expose().as_str()),
                ("resource", AZURE_RESOURCE),
            ])
        }
        AzureSource::AppService { endpoint, header } => {
            debug!("requesting Azure token from App Service identity endpoint");
            http.get(format!("{endpoint}?api-version=2019-08-01&resource={resource}"))
                .header("X-IDENTITY-HEADER", header.expose().as_str())
        }
        AzureSource::Imds { client_id } => {
            debug!("requesting Azure token from instance metadata");
            let mut url = format!("{}?api-version=2018-02-01&resource={resource}", endpoints.imds);
            if let Some(id) = client_id {
                url.push_str(&format!("&client_id={}", encode_query_value(id)));
            }
            http.get(url).header("Metadata", "true")
        }
    };

    let response = request
        .send()
        .await
        .map_err(|e| Error::CloudIdentity(format!("generate Azure auth token: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::CloudIdentity(format!(
            "Azure token endpoint returned {status}: {body}"
        )));
    }
    let token: AzureTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::CloudIdentity(format!("invalid Azure token response: {e}")))?;
    if token.access_token.trim().is_empty() {
        return Err(Error::CloudIdentity("received invalid bearer token".into()));
    }
    Ok(token.access_token)
}

/// Build the `azure` grant from the environment's Azure identity.
pub async fn build_grant(http: &reqwest::Client) -> Result<GrantRequest> {
    let jwt = fetch_token(http, &AzureSource::from_env(), &AzureEndpoints::from_env()).await?;
    Ok(GrantRequest::Azure { jwt })
}
