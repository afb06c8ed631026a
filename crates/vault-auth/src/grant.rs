//! Token endpoint request bodies
//!
//! One variant per grant, serialized with its `grant_type` tag. Each
//! variant lists its required fields in `required_fields`; `validate` turns
//! blank ones into a single `MissingArgument` error naming every flag.

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Serialize)]
#[serde(tag = "grant_type")]
pub enum GrantRequest {
    #[serde(rename = "password")]
    Password {
        username: String,
        password: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        provider: String,
    },
    #[serde(rename = "client_credentials")]
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
    #[serde(rename = "refresh_token")]
    RefreshToken { refresh_token: String },
    #[serde(rename = "certificate")]
    Certificate {
        cert_challenge_id: String,
        decrypted_challenge: String,
    },
    #[serde(rename = "oidc")]
    Oidc {
        #[serde(skip_serializing_if = "String::is_empty")]
        provider: String,
        authorization_code: String,
        state: String,
        callback_url: String,
    },
    #[serde(rename = "aws_iam")]
    AwsIam {
        aws_headers: String,
        aws_body: String,
    },
    #[serde(rename = "azure")]
    Azure { jwt: String },
    #[serde(rename = "gcp")]
    Gcp { jwt: String },
}

impl GrantRequest {
    pub fn grant_type(&self) -> &'static str {
        match self {
            GrantRequest::Password { .. } => "password",
            GrantRequest::ClientCredentials { .. } => "client_credentials",
            GrantRequest::RefreshToken { .. } => "refresh_token",
            GrantRequest::Certificate { .. } => "certificate",
            GrantRequest::Oidc { .. } => "oidc",
            GrantRequest::AwsIam { .. } => "aws_iam",
            GrantRequest::Azure { .. } => "azure",
            GrantRequest::Gcp { .. } => "gcp",
        }
    }

    /// `(value, flag)` pairs that must be non-blank before sending.
    fn required_fields(&self) -> Vec<(&str, &'static str)> {
        match self {
            GrantRequest::Password {
                username, password, ..
            } => vec![(password, "auth-password"), (username, "auth-username")],
            GrantRequest::ClientCredentials {
                client_id,
                client_secret,
            } => vec![
                (client_id, "auth-client-id"),
                (client_secret, "auth-client-secret"),
            ],
            GrantRequest::RefreshToken { refresh_token } => {
                vec![(refresh_token, "refreshtoken")]
            }
            GrantRequest::Certificate {
                cert_challenge_id,
                decrypted_challenge,
            } => vec![
                (cert_challenge_id, "cert-challenge-id"),
                (decrypted_challenge, "decrypted-challenge"),
            ],
            GrantRequest::Oidc {
                authorization_code,
                state,
                callback_url,
                ..
            } => vec![
                (authorization_code, "authorization-code"),
                (state, "state"),
                (callback_url, "auth-callback"),
            ],
            GrantRequest::AwsIam {
                aws_headers,
                aws_body,
            } => vec![(aws_headers, "aws-headers"), (aws_body, "aws-body")],
            GrantRequest::Azure { jwt } | GrantRequest::Gcp { jwt } => vec![(jwt, "jwt")],
        }
        .into_iter()
        .map(|(value, flag)| (value.as_str(), flag))
        .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let missing: Vec<String> = self
            .required_fields()
            .into_iter()
            .filter(|(value, _)| value.trim().is_empty())
            .map(|(_, flag)| flag.to_owned())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingArgument(missing))
        }
    }
}

// Grants carry passwords and secrets, so only the grant type is printed.
impl fmt::Debug for GrantRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantRequest")
            .field("grant_type", &self.grant_type())
            .finish_non_exhaustive()
    }
}
