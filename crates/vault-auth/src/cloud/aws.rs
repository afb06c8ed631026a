//! AWS IAM identity: a SigV4-signed STS `GetCallerIdentity` request
//!
//! The request is signed locally and never sent. The vault replays it
//! against STS to learn the caller's ARN, so only the signed headers and
//! body travel in the `aws_iam` grant, each base64 encoded.
//!
//! Signing credentials come from the first source that has them:
//! 1. `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`, unless a profile is named
//! 2. The profile in `~/.aws/credentials` merged over `~/.aws/config`:
//!    static keys, `role_arn` with `source_profile` or `credential_source`,
//!    or `credential_process`
//! 3. ECS container credentials
//! 4. EC2 instance metadata (IMDSv2, IMDSv1 when no session token is issued)

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use common::Secret;
use hmac::{Hmac, Mac};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::encode_query_value;
use crate::error::{Error, Result};
use crate::grant::GrantRequest;

type HmacSha256 = Hmac<Sha256>;

pub const STS_HOST: &str = "sts.amazonaws.com";
pub const STS_REGION: &str = "us-east-1";
pub const DEFAULT_STS_ENDPOINT: &str = "https://sts.amazonaws.com";
pub const CONTAINER_CREDENTIALS_HOST: &str = "http://169.254.170.2";
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254";

const STS_SERVICE: &str = "sts";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const STS_API_VERSION: &str = "2011-06-15";
const GET_CALLER_IDENTITY_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const DEFAULT_PROFILE: &str = "default";

const IMDS_TOKEN_PATH: &str = "/latest/api/token";
const IMDS_ROLE_PATH: &str = "/latest/meta-data/iam/security-credentials/";
const IMDS_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const IMDS_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const IMDS_TOKEN_TTL: &str = "21600";
const METADATA_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest `source_profile` chain followed before giving up.
const MAX_SOURCE_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: Secret<String>,
    pub session_token: Option<Secret<String>>,
}

impl AwsCredentials {
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Option<Self> {
        let access_key_id = non_empty_env("AWS_ACCESS_KEY_ID")?;
        let secret = non_empty_env("AWS_SECRET_ACCESS_KEY")?;
        Some(Self {
            access_key_id,
            secret_access_key: Secret::new(secret),
            session_token: non_empty_env("AWS_SESSION_TOKEN").map(Secret::new),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

type Section = BTreeMap<String, String>;
type Profiles = BTreeMap<String, Section>;

/// Sections of an AWS ini file with lowercased keys. Config files name
/// profiles `[profile x]`, so `strip_profile` drops that prefix.
fn parse_ini(contents: &str, strip_profile: bool) -> Profiles {
    let mut profiles = Profiles::new();
    let mut section: Option<String> = None;

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim();
            let name = match name.strip_prefix("profile ") {
                Some(stripped) if strip_profile => stripped.trim(),
                _ => name,
            };
            profiles.entry(name.to_owned()).or_default();
            section = Some(name.to_owned());
            continue;
        }
        // Indented lines belong to nested values such as `s3 =`.
        if raw.starts_with([' ', '\t']) {
            continue;
        }
        let Some(name) = &section else { continue };
        if let Some((key, value)) = line.split_once('=') {
            if let Some(values) = profiles.get_mut(name) {
                values.insert(key.trim().to_lowercase(), value.trim().to_owned());
            }
        }
    }
    profiles
}

fn value<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    section.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn static_keys(section: &Section) -> Option<AwsCredentials> {
    let access_key_id = value(section, "aws_access_key_id")?;
    let secret = value(section, "aws_secret_access_key")?;
    Some(AwsCredentials {
        access_key_id: access_key_id.to_owned(),
        secret_access_key: Secret::new(secret.to_owned()),
        session_token: value(section, "aws_session_token").map(|t| Secret::new(t.to_owned())),
    })
}

async fn read_profiles(path: Option<&Path>, strip_profile: bool) -> Result<Profiles> {
    let Some(path) = path else {
        return Ok(Profiles::new());
    };
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(parse_ini(&contents, strip_profile)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Profiles::new()),
        Err(e) => Err(Error::CloudIdentity(format!(
            "reading AWS configuration {}: {e}",
            path.display()
        ))),
    }
}

/// Credentials document returned by `credential_process`, the container
/// endpoint, instance metadata and `AssumeRole`.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialDocument {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    code: Option<String>,
    access_key_id: String,
    secret_access_key: String,
    #[serde(default, alias = "SessionToken")]
    token: Option<String>,
}

impl CredentialDocument {
    fn into_credentials(self, source: &str) -> Result<AwsCredentials> {
        if let Some(code) = self.code.as_deref().filter(|c| *c != "Success") {
            return Err(Error::CloudIdentity(format!(
                "{source} returned credentials with code {code}"
            )));
        }
        if self.access_key_id.is_empty() || self.secret_access_key.is_empty() {
            return Err(Error::CloudIdentity(format!(
                "{source} returned incomplete credentials"
            )));
        }
        Ok(AwsCredentials {
            access_key_id: self.access_key_id,
            secret_access_key: Secret::new(self.secret_access_key),
            session_token: self.token.filter(|t| !t.is_empty()).map(Secret::new),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleEnvelope {
    assume_role_response: AssumeRoleResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    assume_role_result: AssumeRoleResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResult {
    credentials: CredentialDocument,
}

/// ECS task role endpoint.
#[derive(Debug, Clone)]
pub struct ContainerEndpoint {
    pub url: String,
    pub authorization: Option<Secret<String>>,
    pub authorization_file: Option<PathBuf>,
}

impl ContainerEndpoint {
    /// `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` or `_FULL_URI`, with the
    /// optional `AWS_CONTAINER_AUTHORIZATION_TOKEN[_FILE]`.
    fn from_env() -> Option<Self> {
        let url = non_empty_env("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI")
            .map(|uri| format!("{CONTAINER_CREDENTIALS_HOST}{uri}"))
            .or_else(|| non_empty_env("AWS_CONTAINER_CREDENTIALS_FULL_URI"))?;
        Some(Self {
            url,
            authorization: non_empty_env("AWS_CONTAINER_AUTHORIZATION_TOKEN").map(Secret::new),
            authorization_file: non_empty_env("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE")
                .map(PathBuf::from),
        })
    }

    async fn authorization(&self) -> Result<Option<String>> {
        if let Some(token) = &self.authorization {
            return Ok(Some(token.expose().clone()));
        }
        let Some(path) = &self.authorization_file else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::CloudIdentity(format!(
                "reading container authorization token {}: {e}",
                path.display()
            ))
        })?;
        Ok(Some(token.trim().to_owned()))
    }
}

/// Where AWS credentials may come from, in lookup order.
#[derive(Debug, Clone)]
pub struct CredentialChain {
    /// Profile named in vault settings; skips environment keys.
    pub profile: Option<String>,
    pub env_profile: Option<String>,
    pub env_credentials: Option<AwsCredentials>,
    pub credentials_file: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub container: Option<ContainerEndpoint>,
    /// `None` when instance metadata is disabled.
    pub imds_endpoint: Option<String>,
    pub sts_endpoint: String,
}

impl Default for CredentialChain {
    fn default() -> Self {
        Self {
            profile: None,
            env_profile: None,
            env_credentials: None,
            credentials_file: None,
            config_file: None,
            container: None,
            imds_endpoint: None,
            sts_endpoint: DEFAULT_STS_ENDPOINT.to_owned(),
        }
    }
}

impl CredentialChain {
    /// The chain the AWS CLI would use, honouring `AWS_PROFILE`,
    /// `AWS_SHARED_CREDENTIALS_FILE`, `AWS_CONFIG_FILE`, the container
    /// variables, `AWS_EC2_METADATA_DISABLED` and
    /// `AWS_EC2_METADATA_SERVICE_ENDPOINT`.
    pub fn from_env(profile: Option<&str>) -> Self {
        let aws_dir = dirs::home_dir().map(|home| home.join(".aws"));
        let metadata_disabled = std::env::var("AWS_EC2_METADATA_DISABLED")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            profile: profile.map(str::to_owned),
            env_profile: non_empty_env("AWS_PROFILE"),
            env_credentials: AwsCredentials::from_env(),
            credentials_file: non_empty_env("AWS_SHARED_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .or_else(|| aws_dir.as_ref().map(|dir| dir.join("credentials"))),
            config_file: non_empty_env("AWS_CONFIG_FILE")
                .map(PathBuf::from)
                .or_else(|| aws_dir.as_ref().map(|dir| dir.join("config"))),
            container: ContainerEndpoint::from_env(),
            imds_endpoint: if metadata_disabled {
                None
            } else {
                Some(
                    non_empty_env("AWS_EC2_METADATA_SERVICE_ENDPOINT")
                        .unwrap_or_else(|| DEFAULT_IMDS_ENDPOINT.to_owned()),
                )
            },
            sts_endpoint: DEFAULT_STS_ENDPOINT.to_owned(),
        }
    }

    pub async fn resolve(&self, http: &reqwest::Client) -> Result<AwsCredentials> {
        if self.profile.is_none() {
            if let Some(creds) = &self.env_credentials {
                debug!("using AWS credentials from environment");
                return Ok(creds.clone());
            }
        }

        let named = self.profile.as_deref().or(self.env_profile.as_deref());
        let profile = named.unwrap_or(DEFAULT_PROFILE);
        let profiles = self.load_profiles().await?;
        if named.is_some() && !profiles.contains_key(profile) {
            return Err(Error::CloudIdentity(format!(
                "AWS profile '{profile}' not found in {} or {}",
                display(self.credentials_file.as_deref()),
                display(self.config_file.as_deref()),
            )));
        }
        debug!(profile = %profile, "resolving AWS credentials");
        self.profile_credentials(http, &profiles, profile, 0).await
    }

    /// Config-file profiles with credentials-file values layered on top.
    async fn load_profiles(&self) -> Result<Profiles> {
        let mut profiles = read_profiles(self.config_file.as_deref(), true).await?;
        for (name, values) in read_profiles(self.credentials_file.as_deref(), false).await? {
            profiles.entry(name).or_default().extend(values);
        }
        Ok(profiles)
    }

    fn profile_credentials<'a>(
        &'a self,
        http: &'a reqwest::Client,
        profiles: &'a Profiles,
        name: &'a str,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<AwsCredentials>> + Send + 'a>> {
        Box::pin(async move {
            if depth > MAX_SOURCE_DEPTH {
                return Err(Error::CloudIdentity(format!(
                    "AWS source_profile chain too deep at '{name}'"
                )));
            }
            let Some(section) = profiles.get(name) else {
                return self.remote_credentials(http).await;
            };

            // A source profile with its own keys ends the chain.
            if depth > 0 {
                if let Some(creds) = static_keys(section) {
                    return Ok(creds);
                }
            }

            if let Some(role_arn) = value(section, "role_arn") {
                let base = if let Some(source) = value(section, "source_profile") {
                    if source == name {
                        static_keys(section).ok_or_else(|| {
                            Error::CloudIdentity(format!(
                                "AWS profile '{name}' is its own source_profile but has no keys"
                            ))
                        })?
                    } else {
                        if !profiles.contains_key(source) {
                            return Err(Error::CloudIdentity(format!(
                                "AWS source_profile '{source}' of '{name}' not found"
                            )));
                        }
                        self.profile_credentials(http, profiles, source, depth + 1)
                            .await?
                    }
                } else if let Some(source) = value(section, "credential_source") {
                    self.credential_source(http, source).await?
                } else {
                    return Err(Error::CloudIdentity(format!(
                        "AWS profile '{name}' sets role_arn without source_profile or credential_source"
                    )));
                };
                debug!(profile = %name, role_arn = %role_arn, "assuming AWS role");
                return self.assume_role(http, &base, role_arn, section).await;
            }

            if let Some(creds) = static_keys(section) {
                debug!(profile = %name, "using static AWS profile credentials");
                return Ok(creds);
            }

            if let Some(command) = value(section, "credential_process") {
                debug!(profile = %name, "running AWS credential_process");
                return process_credentials(command).await;
            }

            if value(section, "sso_session").is_some() || value(section, "sso_start_url").is_some()
            {
                return Err(Error::CloudIdentity(format!(
                    "AWS profile '{name}' uses IAM Identity Center, which is not supported; \
                     export credentials with `aws configure export-credentials`"
                )));
            }

            self.remote_credentials(http).await
        })
    }

    async fn credential_source(
        &self,
        http: &reqwest::Client,
        source: &str,
    ) -> Result<AwsCredentials> {
        match source {
            "Environment" => self.env_credentials.clone().ok_or_else(|| {
                Error::CloudIdentity("credential_source Environment but no AWS keys in env".into())
            }),
            "EcsContainer" => self.container_credentials(http).await,
            "Ec2InstanceMetadata" => self.imds_credentials(http).await,
            other => Err(Error::CloudIdentity(format!(
                "unsupported AWS credential_source '{other}'"
            ))),
        }
    }

    async fn remote_credentials(&self, http: &reqwest::Client) -> Result<AwsCredentials> {
        if self.container.is_some() {
            return self.container_credentials(http).await;
        }
        if self.imds_endpoint.is_some() {
            return self.imds_credentials(http).await;
        }
        Err(Error::CloudIdentity(
            "no AWS credentials found in environment, profiles, container or instance metadata"
                .into(),
        ))
    }

    async fn container_credentials(&self, http: &reqwest::Client) -> Result<AwsCredentials> {
        let container = self.container.as_ref().ok_or_else(|| {
            Error::CloudIdentity("AWS container credentials endpoint is not set".into())
        })?;
        debug!(url = %container.url, "requesting AWS container credentials");

        let mut request = http.get(&container.url).timeout(METADATA_TIMEOUT);
        if let Some(token) = container.authorization().await? {
            request = request.header(AUTHORIZATION, token);
        }
        let response = request.send().await.map_err(|e| {
            Error::CloudIdentity(format!("container credentials request failed: {e}"))
        })?;
        let document: CredentialDocument = read_json(response, "container credentials").await?;
        document.into_credentials("container credentials endpoint")
    }

    async fn imds_credentials(&self, http: &reqwest::Client) -> Result<AwsCredentials> {
        let base = self
            .imds_endpoint
            .as_deref()
            .ok_or_else(|| Error::CloudIdentity("AWS instance metadata is disabled".into()))?
            .trim_end_matches('/');

        let response = http
            .put(format!("{base}{IMDS_TOKEN_PATH}"))
            .header(IMDS_TTL_HEADER, IMDS_TOKEN_TTL)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::CloudIdentity(format!("instance metadata unreachable: {e}")))?;
        let token = if response.status().is_success() {
            response.text().await.ok().filter(|t| !t.is_empty())
        } else {
            debug!(status = %response.status(), "IMDSv2 token refused, using IMDSv1");
            None
        };

        let get = |path: String| {
            let mut request = http.get(format!("{base}{path}")).timeout(METADATA_TIMEOUT);
            if let Some(token) = &token {
                request = request.header(IMDS_TOKEN_HEADER, token.as_str());
            }
            request
        };

        let response = get(IMDS_ROLE_PATH.to_owned())
            .send()
            .await
            .map_err(|e| Error::CloudIdentity(format!("instance metadata request failed: {e}")))?;
        let roles = read_text(response, "instance role list").await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|r| !r.is_empty())
            .ok_or_else(|| Error::CloudIdentity("no IAM role attached to this instance".into()))?
            .to_owned();
        debug!(role = %role, "requesting AWS instance role credentials");

        let response = get(format!("{IMDS_ROLE_PATH}{role}"))
            .send()
            .await
            .map_err(|e| Error::CloudIdentity(format!("instance metadata request failed: {e}")))?;
        let document: CredentialDocument = read_json(response, "instance credentials").await?;
        document.into_credentials("instance metadata")
    }

    async fn assume_role(
        &self,
        http: &reqwest::Client,
        base: &AwsCredentials,
        role_arn: &str,
        section: &Section,
    ) -> Result<AwsCredentials> {
        let session_name = value(section, "role_session_name")
            .map(str::to_owned)
            .unwrap_or_else(|| format!("vaultctl-{}", Utc::now().timestamp()));
        let mut body = format!(
            "Action=AssumeRole&Version={STS_API_VERSION}&RoleArn={}&RoleSessionName={}",
            encode_query_value(role_arn),
            encode_query_value(&session_name),
        );
        if let Some(external_id) = value(section, "external_id") {
            body.push_str(&format!("&ExternalId={}", encode_query_value(external_id)));
        }
        if let Some(duration) = value(section, "duration_seconds") {
            body.push_str(&format!("&DurationSeconds={}", encode_query_value(duration)));
        }

        let host = endpoint_host(&self.sts_endpoint);
        let signed = sign_sts_request(base, host, STS_REGION, &body, Utc::now())?;
        let mut request = http
            .post(&self.sts_endpoint)
            .header(ACCEPT, "application/json");
        for (name, values) in &signed.headers {
            if name == "Host" {
                continue;
            }
            for value in values {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        let response = request
            .body(signed.body)
            .send()
            .await
            .map_err(|e| Error::CloudIdentity(format!("AssumeRole request failed: {e}")))?;
        let envelope: AssumeRoleEnvelope = read_json(response, "AssumeRole").await?;
        envelope
            .assume_role_response
            .assume_role_result
            .credentials
            .into_credentials("AssumeRole")
    }
}

fn display(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| String::from("<unset>"))
}

fn endpoint_host(endpoint: &str) -> &str {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .unwrap_or(endpoint);
    rest.split('/').next().unwrap_or(rest)
}

async fn read_text(response: reqwest::Response, what: &str) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::CloudIdentity(format!("reading {what} response: {e}")))?;
    if !status.is_success() {
        return Err(Error::CloudIdentity(format!(
            "{what} returned {status}: {body}"
        )));
    }
    Ok(body)
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    let body = read_text(response, what).await?;
    serde_json::from_str(&body)
        .map_err(|e| Error::CloudIdentity(format!("invalid {what} response: {e}")))
}

fn shell(command: &str) -> tokio::process::Command {
    let (program, flag) = if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.arg(flag).arg(command);
    cmd
}

/// Run a `credential_process` command and parse its JSON output.
async fn process_credentials(command: &str) -> Result<AwsCredentials> {
    let output = shell(command)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| Error::CloudIdentity(format!("running credential_process: {e}")))?;
    if !output.status.success() {
        return Err(Error::CloudIdentity(format!(
            "credential_process exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let document: CredentialDocument = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::CloudIdentity(format!("invalid credential_process output: {e}")))?;
    match document.version {
        Some(1) => document.into_credentials("credential_process"),
        other => Err(Error::CloudIdentity(format!(
            "unsupported credential_process Version {other:?}"
        ))),
    }
}

/// A signed request, reduced to what the vault needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// Header name to values, as an HTTP client would carry them.
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

impl SignedRequest {
    pub fn encoded_headers(&self) -> Result<String> {
        let json = serde_json::to_vec(&self.headers)
            .map_err(|e| Error::CloudIdentity(format!("encoding AWS headers: {e}")))?;
        Ok(STANDARD.encode(json))
    }

    pub fn encoded_body(&self) -> String {
        STANDARD.encode(self.body.as_bytes())
    }
}

fn hmac(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::CloudIdentity(format!("signing key: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Sign an STS `GetCallerIdentity` POST for `host` in `region` at `now`.
pub fn sign_get_caller_identity(
    creds: &AwsCredentials,
    host: &str,
    region: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    sign_sts_request(creds, host, region, GET_CALLER_IDENTITY_BODY, now)
}

/// SigV4 for a form-encoded STS POST to `/`.
fn sign_sts_request(
    creds: &AwsCredentials,
    host: &str,
    region: &str,
    body: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut signed: Vec<(&str, String)> = vec![
        ("content-type", FORM_CONTENT_TYPE.to_owned()),
        ("host", host.to_owned()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &creds.session_token {
        signed.push(("x-amz-security-token", token.expose().clone()));
    }
    signed.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");
    let payload_hash = hex(&Sha256::digest(body.as_bytes()));
    let canonical_request =
        format!("POST\n/\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");

    let scope = format!("{date}/{region}/{STS_SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex(&Sha256::digest(canonical_request.as_bytes()))
    );

    let secret = format!("AWS4{}", creds.secret_access_key.expose());
    let k_date = hmac(secret.as_bytes(), &date)?;
    let k_region = hmac(&k_date, region)?;
    let k_service = hmac(&k_region, STS_SERVICE)?;
    let k_signing = hmac(&k_service, "aws4_request")?;
    let signature = hex(&hmac(&k_signing, &string_to_sign)?);

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        creds.access_key_id
    );

    let mut headers = BTreeMap::new();
    headers.insert("Authorization".to_owned(), vec![authorization]);
    headers.insert("Content-Type".to_owned(), vec![FORM_CONTENT_TYPE.to_owned()]);
    headers.insert("Host".to_owned(), vec![host.to_owned()]);
    headers.insert("X-Amz-Date".to_owned(), vec![amz_date]);
    if let Some(token) = &creds.session_token {
        headers.insert(
            "X-Amz-Security-Token".to_owned(),
            vec![token.expose().clone()],
        );
    }

    Ok(SignedRequest {
        headers,
        body: body.to_owned(),
    })
}

/// Build the `aws_iam` grant from local AWS credentials.
pub async fn build_grant(http: &reqwest::Client, profile: Option<&str>) -> Result<GrantRequest> {
    let creds = CredentialChain::from_env(profile).resolve(http).await?;
    let signed = sign_get_caller_identity(&creds, STS_HOST, STS_REGION, Utc::now())?;
    Ok(GrantRequest::AwsIam {
        aws_headers: signed.encoded_headers()?,
        aws_body: signed.encoded_body(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post, put};
    use axum::{Form, Router};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn example_creds(token: Option<&str>) -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: Secret::new("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into()),
            session_token: token.map(|t| Secret::new(t.to_owned())),
        }
    }

    fn example_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    async fn start_server(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// A chain over files in `dir` with every remote source switched off.
    fn file_chain(dir: &Path, profile: Option<&str>) -> CredentialChain {
        CredentialChain {
            profile: profile.map(str::to_owned),
            credentials_file: Some(dir.join("credentials")),
            config_file: Some(dir.join("config")),
            ..Default::default()
        }
    }

    fn credentials_json(key: &str, token_field: &str) -> serde_json::Value {
        serde_json::json!({
            "Code": "Success",
            "AccessKeyId": key,
            "SecretAccessKey": format!("{key}-secret"),
            token_field: format!("{key}-token"),
            "Expiration": "2099-01-01T00:00:00Z",
        })
    }

    #[test]
    fn signature_matches_reference() {
        let signed = sign_get_caller_identity(
            &example_creds(None),
            STS_HOST,
            STS_REGION,
            example_time(),
        )
        .unwrap();
        assert_eq!(
            signed.headers["Authorization"][0],
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/sts/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, \
             Signature=6fb20d31f734d876c5682fdd2678d194cf68b862755f83b7ba1373c0874be25c"
        );
        assert_eq!(signed.headers["X-Amz-Date"], vec!["20150830T123600Z"]);
        assert!(!signed.headers.contains_key("X-Amz-Security-Token"));
    }

    #[test]
    fn session_token_is_signed() {
        let signed = sign_get_caller_identity(
            &example_creds(Some("session-token")),
            STS_HOST,
            STS_REGION,
            example_time(),
        )
        .unwrap();
        let auth = &signed.headers["Authorization"][0];
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date;x-amz-security-token"));
        assert!(auth.ends_with(
            "Signature=88e95180462ec81f50b105898b1f7c08d35b721139c1a374caedfca06700bcc9"
        ));
        assert_eq!(signed.headers["X-Amz-Security-Token"], vec!["session-token"]);
    }

    #[test]
    fn encoded_parts_decode_to_headers_and_body() {
        let signed = sign_get_caller_identity(
            &example_creds(None),
            STS_HOST,
            STS_REGION,
            example_time(),
        )
        .unwrap();
        let body = STANDARD.decode(signed.encoded_body()).unwrap();
        assert_eq!(body, GET_CALLER_IDENTITY_BODY.as_bytes());

        let headers = STANDARD.decode(signed.encoded_headers().unwrap()).unwrap();
        let headers: BTreeMap<String, Vec<String>> = serde_json::from_slice(&headers).unwrap();
        assert_eq!(headers["Content-Type"], vec![FORM_CONTENT_TYPE]);
    }

    #[test]
    fn ini_sections_and_prefixes() {
        let contents = "\
[default]
aws_access_key_id = AKIDDEFAULT
aws_secret_access_key = secret-default

# staging account
[profile staging]
aws_access_key_id=AKIDSTAGING
aws_secret_access_key=secret-staging
aws_session_token=tok
s3 =
  max_concurrent_requests = 10
";
        let config = parse_ini(contents, true);
        let default = static_keys(&config["default"]).unwrap();
        assert_eq!(default.access_key_id, "AKIDDEFAULT");
        assert!(default.session_token.is_none());

        let staging = static_keys(&config["staging"]).unwrap();
        assert_eq!(staging.secret_access_key.expose(), "secret-staging");
        assert_eq!(staging.session_token.unwrap().expose(), "tok");
        assert!(!config["staging"].contains_key("max_concurrent_requests"));

        // Credentials files take section names literally.
        let credentials = parse_ini(contents, false);
        assert!(credentials.contains_key("profile staging"));
        assert!(!credentials.contains_key("staging"));
    }

    #[tokio::test]
    async fn environment_keys_win_unless_profile_is_named() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("credentials"),
            "[work]\naws_access_key_id = AKIDWORK\naws_secret_access_key = w\n",
        )
        .await
        .unwrap();
        let http = reqwest::Client::new();

        let mut chain = file_chain(dir.path(), None);
        chain.env_credentials = Some(example_creds(None));
        assert_eq!(chain.resolve(&http).await.unwrap().access_key_id, "AKIDEXAMPLE");

        chain.profile = Some("work".into());
        assert_eq!(chain.resolve(&http).await.unwrap().access_key_id, "AKIDWORK");
    }

    #[tokio::test]
    async fn config_file_profile_resolves() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("config"),
            "[profile dev]\nregion = eu-west-1\naws_access_key_id = AKIDDEV\naws_secret_access_key = d\n",
        )
        .await
        .unwrap();

        let creds = file_chain(dir.path(), Some("dev"))
            .resolve(&reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDDEV");
        assert_eq!(creds.secret_access_key.expose(), "d");
    }

    #[tokio::test]
    async fn aws_config_file_env_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("aws-config");
        tokio::fs::write(
            &config,
            "[profile dev]\naws_access_key_id = AKIDDEV\naws_secret_access_key = d\n",
        )
        .await
        .unwrap();

        let chain = {
            let _lock = ENV_MUTEX.lock().unwrap();
            unsafe {
                set_env("AWS_CONFIG_FILE", config.to_str().unwrap());
                set_env(
                    "AWS_SHARED_CREDENTIALS_FILE",
                    dir.path().join("none").to_str().unwrap(),
                );
                set_env("AWS_EC2_METADATA_DISABLED", "true");
            }
            let chain = CredentialChain::from_env(Some("dev"));
            unsafe {
                remove_env("AWS_CONFIG_FILE");
                remove_env("AWS_SHARED_CREDENTIALS_FILE");
                remove_env("AWS_EC2_METADATA_DISABLED");
            }
            chain
        };

        assert!(chain.imds_endpoint.is_none());
        let creds = chain.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(creds.access_key_id, "AKIDDEV");
    }

    #[tokio::test]
    async fn credentials_file_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("config"),
            "[default]\naws_access_key_id = AKIDCONFIG\naws_secret_access_key = c\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("credentials"),
            "[default]\naws_access_key_id = AKIDCREDS\naws_secret_access_key = k\n",
        )
        .await
        .unwrap();

        let creds = file_chain(dir.path(), None)
            .resolve(&reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDCREDS");
    }

    #[tokio::test]
    async fn unknown_named_profile_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_chain(dir.path(), Some("prod"))
            .resolve(&reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CloudIdentity(_)));
        assert!(err.to_string().contains("'prod'"), "got: {err}");
    }

    #[tokio::test]
    async fn sso_profile_is_rejected_with_guidance() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("config"),
            "[profile sso]\nsso_session = corp\nsso_account_id = 1\n",
        )
        .await
        .unwrap();
        let err = file_chain(dir.path(), Some("sso"))
            .resolve(&reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("export-credentials"), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn credential_process_output_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let doc = serde_json::json!({
            "Version": 1,
            "AccessKeyId": "AKIDPROC",
            "SecretAccessKey": "p",
            "SessionToken": "proc-token",
        });
        tokio::fs::write(
            dir.path().join("config"),
            format!("[default]\ncredential_process = echo '{doc}'\n"),
        )
        .await
        .unwrap();

        let creds = file_chain(dir.path(), None)
            .resolve(&reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(creds.access_key_id, "AKIDPROC");
        assert_eq!(creds.session_token.unwrap().expose(), "proc-token");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_credential_process_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("config"),
            "[default]\ncredential_process = echo expired >&2; exit 3\n",
        )
        .await
        .unwrap();

        let err = file_chain(dir.path(), None)
            .resolve(&reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired"), "got: {err}");
    }

    #[tokio::test]
    async fn source_profile_assumes_role() {
        let app = Router::new().route(
            "/",
            post(|headers: HeaderMap, Form(form): Form<HashMap<String, String>>| async move {
                let auth = headers["authorization"].to_str().unwrap();
                assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDBASE/"), "{auth}");
                assert_eq!(headers["accept"], "application/json");
                assert_eq!(form["Action"], "AssumeRole");
                assert_eq!(form["RoleArn"], "arn:aws:iam::123456789012:role/deploy");
                assert_eq!(form["RoleSessionName"], "ci");
                assert_eq!(form["ExternalId"], "ext-1");
                axum::Json(serde_json::json!({
                    "AssumeRoleResponse": {
                        "AssumeRoleResult": {
                            "Credentials": credentials_json("ASIAROLE", "SessionToken"),
                        }
                    }
                }))
            }),
        );
        let sts = start_server(app).await;

        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("config"),
            "\
[profile deploy]
role_arn = arn:aws:iam::123456789012:role/deploy
source_profile = base
role_session_name = ci
external_id = ext-1
",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("credentials"),
            "[base]\naws_access_key_id = AKIDBASE\naws_secret_access_key = b\n",
        )
        .await
        .unwrap();

        let mut chain = file_chain(dir.path(), Some("deploy"));
        chain.sts_endpoint = sts;
        let creds = chain.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(creds.access_key_id, "ASIAROLE");
        assert_eq!(creds.session_token.unwrap().expose(), "ASIAROLE-token");
    }

    #[tokio::test]
    async fn container_credentials_with_authorization() {
        let app = Router::new().route(
            "/v2/credentials/task",
            get(|headers: HeaderMap| async move {
                let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
                if auth != Some("task-secret") {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                axum::Json(credentials_json("ASIATASK", "Token")).into_response()
            }),
        );
        let base = start_server(app).await;

        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("token");
        tokio::fs::write(&token_file, "task-secret\n").await.unwrap();
        let mut chain = file_chain(dir.path(), None);
        chain.container = Some(ContainerEndpoint {
            url: format!("{base}/v2/credentials/task"),
            authorization: None,
            authorization_file: Some(token_file),
        });

        let creds = chain.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(creds.access_key_id, "ASIATASK");
        assert_eq!(creds.session_token.unwrap().expose(), "ASIATASK-token");
    }

    fn imds_app(issue_token: bool) -> Router {
        let check = move |headers: &HeaderMap| {
            let token = headers.get(IMDS_TOKEN_HEADER).and_then(|v| v.to_str().ok());
            !issue_token || token == Some("imds-tok")
        };
        Router::new()
            .route(
                IMDS_TOKEN_PATH,
                put(move |headers: HeaderMap| async move {
                    if !issue_token {
                        return StatusCode::FORBIDDEN.into_response();
                    }
                    assert_eq!(headers[IMDS_TTL_HEADER], IMDS_TOKEN_TTL);
                    "imds-tok".into_response()
                }),
            )
            .route(
                IMDS_ROLE_PATH,
                get(move |headers: HeaderMap| async move {
                    if !check(&headers) {
                        return StatusCode::UNAUTHORIZED.into_response();
                    }
                    "web-role\n".into_response()
                }),
            )
            .route(
                "/latest/meta-data/iam/security-credentials/web-role",
                get(move |headers: HeaderMap| async move {
                    if !check(&headers) {
                        return StatusCode::UNAUTHORIZED.into_response();
                    }
                    axum::Json(credentials_json("ASIAEC2", "Token")).into_response()
                }),
            )
    }

    #[tokio::test]
    async fn instance_metadata_v2_credentials() {
        let base = start_server(imds_app(true)).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chain = file_chain(dir.path(), None);
        chain.imds_endpoint = Some(base);

        let creds = chain.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(creds.access_key_id, "ASIAEC2");
        assert_eq!(creds.secret_access_key.expose(), "ASIAEC2-secret");
    }

    #[tokio::test]
    async fn instance_metadata_v1_when_token_refused() {
        let base = start_server(imds_app(false)).await;
        let dir = tempfile::tempdir().unwrap();
        let mut chain = file_chain(dir.path(), None);
        chain.imds_endpoint = Some(format!("{base}/"));

        let creds = chain.resolve(&reqwest::Client::new()).await.unwrap();
        assert_eq!(creds.access_key_id, "ASIAEC2");
    }

    #[tokio::test]
    async fn nothing_configured_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_chain(dir.path(), None)
            .resolve(&reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no AWS credentials"), "got: {err}");
    }
}
