//! Backend selection
//!
//! The selector is built once by the binary and passed to the
//! authenticator. The first `open` decides the backend for the rest of the
//! process; asking for a different kind afterwards is an error instead of a
//! silent switch.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{Error, Result};
use crate::file::FileStore;
use crate::kind::StoreKind;
use crate::none::NoneStore;
use crate::pass::PassHelper;
use crate::secure::SecureStore;
use crate::CredentialStore;

/// `store.type` and `store.path` from configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub kind: StoreKind,
    /// Directory for the file store and encryption key files. Defaults to
    /// `~/.vaultctl`.
    pub path: Option<PathBuf>,
}

impl StoreOptions {
    pub fn new(kind: StoreKind) -> Self {
        Self { kind, path: None }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Directory holding file-store entries and encryption key files.
    pub fn dir(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => FileStore::default_dir(),
        }
    }
}

#[derive(Default)]
pub struct StoreSelector {
    opened: OnceCell<Arc<dyn CredentialStore>>,
}

impl StoreSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or return the already opened) store for `options`.
    pub async fn open(&self, options: &StoreOptions) -> Result<Arc<dyn CredentialStore>> {
        options.kind.ensure_supported()?;

        let store = self.opened.get_or_try_init(|| build(options)).await?;
        if store.kind() != options.kind {
            return Err(Error::StoreTypeImmutable {
                old: store.kind(),
                new: options.kind,
            });
        }
        Ok(Arc::clone(store))
    }

    /// Kind of the opened store, if any.
    pub fn current(&self) -> Option<StoreKind> {
        self.opened.get().map(|store| store.kind())
    }
}

async fn build(options: &StoreOptions) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match options.kind {
        StoreKind::File => Arc::new(FileStore::new(options.dir()?)),
        StoreKind::None => Arc::new(NoneStore),
        StoreKind::PassLinux => {
            let helper = PassHelper::new()?;
            helper.check_initialized().await?;
            Arc::new(SecureStore::new(helper))
        }
        StoreKind::WinCred => wincred()?,
    };
    info!(kind = %options.kind, "opened credential store");
    Ok(store)
}

#[cfg(windows)]
fn wincred() -> Result<Arc<dyn CredentialStore>> {
    Ok(Arc::new(SecureStore::new(crate::wincred::WinCredHelper::new())))
}

#[cfg(not(windows))]
fn wincred() -> Result<Arc<dyn CredentialStore>> {
    Err(Error::StoreUnsupported {
        kind: StoreKind::WinCred,
        os: "windows",
    })
}
