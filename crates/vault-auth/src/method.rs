//! Supported login methods

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Login method named by `auth.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    Password,
    Refresh,
    ClientCredential,
    FederatedThyOne,
    Certificate,
    FederatedAws,
    FederatedAzure,
    FederatedGcp,
    Oidc,
}

impl AuthMethod {
    pub const ALL: [AuthMethod; 9] = [
        AuthMethod::Password,
        AuthMethod::Refresh,
        AuthMethod::ClientCredential,
        AuthMethod::FederatedThyOne,
        AuthMethod::Certificate,
        AuthMethod::FederatedAws,
        AuthMethod::FederatedAzure,
        AuthMethod::FederatedGcp,
        AuthMethod::Oidc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Password => "password",
            AuthMethod::Refresh => "refresh",
            AuthMethod::ClientCredential => "clientcred",
            AuthMethod::FederatedThyOne => "thy-one",
            AuthMethod::Certificate => "cert",
            AuthMethod::FederatedAws => "aws",
            AuthMethod::FederatedAzure => "azure",
            AuthMethod::FederatedGcp => "gcp",
            AuthMethod::Oidc => "oidc",
        }
    }

    /// Segment used in the token cache key. Refresh tokens are issued for
    /// password logins, so both share one cache entry.
    pub fn cache_prefix(self) -> &'static str {
        match self {
            AuthMethod::Refresh => AuthMethod::Password.as_str(),
            other => other.as_str(),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = Error;

    /// Parse an `auth.type` value; empty means password.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(AuthMethod::Password);
        }
        AuthMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::UnknownAuthType(s.to_owned()))
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_defaults_to_password() {
        assert_eq!("".parse::<AuthMethod>().unwrap(), AuthMethod::Password);
    }

    #[test]
    fn every_name_parses_back() {
        for method in AuthMethod::ALL {
            assert_eq!(method.as_str().parse::<AuthMethod>().unwrap(), method);
        }
    }

    #[test]
    fn unknown_name_is_configuration_error() {
        let err = "kerberos".parse::<AuthMethod>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.to_string(), "unknown auth type: kerberos");
    }

    #[test]
    fn refresh_shares_password_cache_prefix() {
        assert_eq!(AuthMethod::Refresh.cache_prefix(), "password");
        assert_eq!(AuthMethod::Certificate.cache_prefix(), "cert");
    }
}
