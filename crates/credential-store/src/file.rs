//! File-backed credential store
//!
//! One JSON file per key inside the store directory. Writes go through a
//! temp file + rename so a crash never leaves a half-written token behind.
//! Files are 0600 and the directory 0700 on unix.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::kind::StoreKind;
use crate::{BoxFuture, CredentialStore, decode_payload, validate_key};

/// Directory name under the home directory used when no path is configured.
pub const DEFAULT_DIR_NAME: &str = ".vaultctl";

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.vaultctl`
    pub fn default_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(DEFAULT_DIR_NAME))
            .ok_or_else(|| Error::Io("cannot determine home directory".into()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

impl CredentialStore for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    fn store<'a>(&'a self, key: &'a str, value: &'a Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let json = serde_json::to_vec_pretty(value)
                .map_err(|e| Error::Serialization(format!("encoding {key}: {e}")))?;
            ensure_dir(&self.dir).await?;
            write_atomic(&path, &json).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => Ok(Some(decode_payload(&contents))),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Error::Io(format!("reading {}: {e}", path.display()))),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(key, "deleted store entry");
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Io(format!("removing {}: {e}", path.display()))),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(&self.dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(Error::Io(format!(
                        "listing {}: {e}",
                        self.dir.display()
                    )));
                }
            };

            let mut keys = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Io(format!("listing {}: {e}", self.dir.display())))?
            {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                // Temp files from in-flight writes start with a dot
                if name.starts_with('.') || !name.starts_with(prefix) {
                    continue;
                }
                if entry.file_type().await.is_ok_and(|t| t.is_file()) {
                    keys.push(name);
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}

/// Create the store directory with owner-only permissions.
pub(crate) async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        tokio::fs::set_permissions(dir, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store directory permissions: {e}")))?;
    }
    Ok(())
}

/// Write `data` to `path` atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Io("store path has no file name".into()))?;

    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store entry");
    Ok(())
}
