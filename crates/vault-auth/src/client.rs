//! JSON-over-HTTP transport to the vault API
//!
//! URLs have the shape `{scheme}://{tenant}.{domain}[:port]/{version}/{path}`.
//! Tests point the client at a local server with `with_base_url`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::constants::{DEFAULT_API_VERSION, DEFAULT_DOMAIN, DEFAULT_SCHEME};
use crate::error::{Error, Result};

/// Where the tenant's vault lives.
#[derive(Debug, Clone)]
pub struct VaultEndpoint {
    pub tenant: String,
    pub domain: String,
    pub scheme: String,
    pub port: Option<u16>,
    pub api_version: String,
    base_url: Option<String>,
}

impl VaultEndpoint {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            domain: DEFAULT_DOMAIN.to_owned(),
            scheme: DEFAULT_SCHEME.to_owned(),
            port: None,
            api_version: DEFAULT_API_VERSION.to_owned(),
            base_url: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Replace `{scheme}://{tenant}.{domain}[:port]` with a fixed base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// `{scheme}://{tenant}.{domain}[:port]`, or the base URL override.
    pub fn origin(&self) -> String {
        if let Some(base) = &self.base_url {
            return base.trim_end_matches('/').to_owned();
        }
        match self.port {
            Some(port) => format!("{}://{}.{}:{port}", self.scheme, self.tenant, self.domain),
            None => format!("{}://{}.{}", self.scheme, self.tenant, self.domain),
        }
    }

    /// `https://{tenant}.{domain}`, the audience the vault expects in cloud
    /// identity tokens. Scheme, port and base URL overrides do not apply.
    pub fn audience(&self) -> String {
        format!("https://{}.{}", self.tenant, self.domain)
    }

    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.origin(),
            self.api_version,
            path.trim_start_matches('/')
        )
    }
}

#[derive(Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    endpoint: VaultEndpoint,
}

impl VaultClient {
    pub fn new(http: reqwest::Client, endpoint: VaultEndpoint) -> Self {
        Self { http, endpoint }
    }

    pub fn endpoint(&self) -> &VaultEndpoint {
        &self.endpoint
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// POST `body` as JSON to `path` and decode the JSON response.
    ///
    /// Non-2xx responses become `Error::Rejected` carrying the body verbatim.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint.url(path);
        debug!(url = %url, "POST");

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST {url}: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("reading response from {url}: {e}")))?;

        if !status.is_success() {
            let body = if text.is_empty() {
                String::from("<no body>")
            } else {
                text
            };
            return Err(Error::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        if text.trim().is_empty() {
            return Err(Error::Protocol(format!("empty response from {url}")));
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Protocol(format!("invalid response from {url}: {e}")))
    }
}
