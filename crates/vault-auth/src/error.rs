//! Error types for authentication

/// Coarse error category, used by the CLI to pick exit messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    CredentialStore,
    Crypto,
    Transport,
    Protocol,
    AuthenticationFailed,
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown auth type: {0}")]
    UnknownAuthType(String),

    /// One or more required flags were blank.
    #[error("{} must be set", flag_list(.0))]
    MissingArgument(Vec<String>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("credential store error: {0}")]
    Store(#[from] credential_store::Error),

    #[error("failed to find the encryption key")]
    KeyfileNotFound,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("server returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to authenticate with auth type '{method}': {reason}")]
    AuthenticationFailed { method: String, reason: String },

    #[error("cloud identity error: {0}")]
    CloudIdentity(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl Error {
    pub fn missing(flags: &[&str]) -> Self {
        Error::MissingArgument(flags.iter().map(|f| (*f).to_owned()).collect())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownAuthType(_) | Error::MissingArgument(_) | Error::Config(_) => {
                ErrorKind::Configuration
            }
            Error::Store(_) => ErrorKind::CredentialStore,
            Error::KeyfileNotFound | Error::Crypto(_) => ErrorKind::Crypto,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Rejected { .. }
            | Error::AuthenticationFailed { .. }
            | Error::CloudIdentity(_) => {
                ErrorKind::AuthenticationFailed
            }
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

fn flag_list(flags: &[String]) -> String {
    flags
        .iter()
        .map(|f| format!("--{}", f.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" or ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_argument_lists_every_flag() {
        let err = Error::missing(&["auth-username", "auth-password"]);
        assert_eq!(
            err.to_string(),
            "--auth-username or --auth-password must be set"
        );
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn store_errors_keep_their_cause() {
        let err: Error = credential_store::Error::Io("disk full".into()).into();
        assert_eq!(err.kind(), ErrorKind::CredentialStore);
        assert!(err.to_string().contains("disk full"), "got: {err}");
    }

    #[test]
    fn authentication_failed_names_method() {
        let err = Error::AuthenticationFailed {
            method: "password".into(),
            reason: "invalid credentials".into(),
        };
        assert!(err.to_string().contains("'password'"));
        assert!(err.to_string().contains("invalid credentials"));
    }

    #[test]
    fn keyfile_missing_is_crypto() {
        assert_eq!(Error::KeyfileNotFound.kind(), ErrorKind::Crypto);
        assert_eq!(
            Error::KeyfileNotFound.to_string(),
            "failed to find the encryption key"
        );
    }
}
