//! Error types for credential store operations

use crate::kind::StoreKind;

/// Errors from credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown store type: {0}")]
    UnknownStoreType(String),

    #[error("'{kind}' option for store.type is supported on {os} only")]
    StoreUnsupported { kind: StoreKind, os: &'static str },

    #[error("store type cannot be changed during execution (old: {old}, new: {new})")]
    StoreTypeImmutable { old: StoreKind, new: StoreKind },

    #[error("store type '{0}' cannot hold secure settings")]
    NotSecure(StoreKind),

    #[error("invalid store key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("keychain helper failed: {0}")]
    Helper(String),
}

/// Result alias for credential store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_message_names_kind_and_os() {
        let err = Error::StoreUnsupported {
            kind: StoreKind::WinCred,
            os: "windows",
        };
        assert_eq!(
            err.to_string(),
            "'wincred' option for store.type is supported on windows only"
        );
    }

    #[test]
    fn immutable_message_names_both_kinds() {
        let err = Error::StoreTypeImmutable {
            old: StoreKind::File,
            new: StoreKind::None,
        };
        assert_eq!(
            err.to_string(),
            "store type cannot be changed during execution (old: file, new: none)"
        );
    }
}
