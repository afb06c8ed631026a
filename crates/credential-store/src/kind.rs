//! Store kind names as they appear in `store.type`

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Backend selected by the `store.type` setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StoreKind {
    #[default]
    File,
    None,
    PassLinux,
    WinCred,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::File => "file",
            StoreKind::None => "none",
            StoreKind::PassLinux => "pass_linux",
            StoreKind::WinCred => "wincred",
        }
    }

    /// Whether the backend keeps values inside an OS keychain rather than
    /// in plain files.
    pub fn is_secure(self) -> bool {
        matches!(self, StoreKind::PassLinux | StoreKind::WinCred)
    }

    /// Reject native backends on hosts that cannot run them.
    pub fn ensure_supported(self) -> Result<()> {
        match self {
            StoreKind::PassLinux if !cfg!(target_os = "linux") => Err(Error::StoreUnsupported {
                kind: self,
                os: "linux",
            }),
            StoreKind::WinCred if !cfg!(windows) => Err(Error::StoreUnsupported {
                kind: self,
                os: "windows",
            }),
            _ => Ok(()),
        }
    }
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "file" => Ok(StoreKind::File),
            "none" => Ok(StoreKind::None),
            "pass_linux" => Ok(StoreKind::PassLinux),
            "wincred" => Ok(StoreKind::WinCred),
            other => Err(Error::UnknownStoreType(other.to_owned())),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
