//! `pass` (the standard unix password manager) keychain helper
//!
//! Entries live under the `vaultctl/` folder of the password store. A key
//! such as `token-password-acme-default` maps to
//! `vaultctl/token/password/acme/ZGVmYXVsdA`: every `-` becomes a folder
//! separator and the final segment is base64url encoded so profile names
//! survive as one path component.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::kind::StoreKind;
use crate::secure::KeychainHelper;
use crate::BoxFuture;

/// Folder inside the password store that holds every vaultctl entry.
pub const PASS_ROOT: &str = "vaultctl";

const GPG_SUFFIX: &str = ".gpg";

pub struct PassHelper {
    program: PathBuf,
    base_args: Vec<OsString>,
    store_dir: PathBuf,
}

impl PassHelper {
    /// Helper for the `pass` binary on `PATH`, using `$PASSWORD_STORE_DIR`
    /// or `~/.password-store`.
    pub fn new() -> Result<Self> {
        let store_dir = match std::env::var_os("PASSWORD_STORE_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .map(|home| home.join(".password-store"))
                .ok_or_else(|| Error::Io("cannot determine home directory".into()))?,
        };
        Ok(Self::with_program("pass", Vec::new(), store_dir))
    }

    /// Helper running `program base_args... <pass args>` against `store_dir`.
    pub fn with_program(
        program: impl Into<PathBuf>,
        base_args: Vec<OsString>,
        store_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            store_dir: store_dir.into(),
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Fail unless `pass` is installed and its store is initialised.
    pub async fn check_initialized(&self) -> Result<()> {
        let output = self.run(&["ls"], None).await?;
        if !output.status.success() {
            return Err(Error::Helper(format!(
                "pass is not initialized: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<Output> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(args)
            .env("PASSWORD_STORE_DIR", &self.store_dir)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::Helper(format!("starting {}: {e}", self.program.display())))?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| Error::Helper("pass stdin unavailable".into()))?;
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| Error::Helper(format!("writing to pass: {e}")))?;
            drop(pipe);
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| Error::Helper(format!("waiting for pass: {e}")))
    }
}

/// Password-store path for a store key.
pub fn entry_path(key: &str) -> String {
    let mut segments: Vec<String> = key.split('-').map(str::to_owned).collect();
    if let Some(last) = segments.last_mut() {
        *last = URL_SAFE_NO_PAD.encode(last.as_bytes());
    }
    format!("{PASS_ROOT}/{}", segments.join("/"))
}

/// Store key for a path relative to the `vaultctl/` folder, without the
/// `.gpg` suffix. Returns `None` for entries this tool did not write.
pub fn key_from_entry(relative: &str) -> Option<String> {
    let (head, last) = match relative.rsplit_once('/') {
        Some((head, last)) => (head, last),
        None => ("", relative),
    };
    let last = String::from_utf8(URL_SAFE_NO_PAD.decode(last).ok()?).ok()?;
    if head.is_empty() {
        Some(last)
    } else {
        Some(format!("{}-{last}", head.replace('/', "-")))
    }
}

fn is_missing(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr).contains("is not in the password store")
}

impl KeychainHelper for PassHelper {
    fn kind(&self) -> StoreKind {
        StoreKind::PassLinux
    }

    fn add<'a>(&'a self, key: &'a str, secret: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = entry_path(key);
            let output = self
                .run(&["insert", "-f", "-m", &path], Some(secret))
                .await?;
            if !output.status.success() {
                return Err(Error::Helper(format!(
                    "pass insert {path}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            debug!(key, "stored entry in pass");
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let path = entry_path(key);
            let output = self.run(&["show", &path], None).await?;
            if !output.status.success() {
                if is_missing(&output) {
                    return Ok(None);
                }
                return Err(Error::Helper(format!(
                    "pass show {path}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            let mut value = String::from_utf8(output.stdout)
                .map_err(|e| Error::Helper(format!("pass show {path}: {e}")))?;
            if value.ends_with('\n') {
                value.pop();
            }
            Ok(Some(value))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = entry_path(key);
            let output = self.run(&["rm", "-rf", &path], None).await?;
            if !output.status.success() && !is_missing(&output) {
                return Err(Error::Helper(format!(
                    "pass rm {path}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            debug!(key, "deleted entry from pass");
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let root = self.store_dir.join(PASS_ROOT);
            let mut keys = Vec::new();
            let mut pending = vec![root.clone()];

            while let Some(dir) = pending.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        return Err(Error::Io(format!("listing {}: {e}", dir.display())));
                    }
                };
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| Error::Io(format!("listing {}: {e}", dir.display())))?
                {
                    let path = entry.path();
                    if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                        pending.push(path);
                        continue;
                    }
                    let Some(relative) = path
                        .strip_prefix(&root)
                        .ok()
                        .and_then(|p| p.to_str())
                        .and_then(|p| p.strip_suffix(GPG_SUFFIX))
                    else {
                        continue;
                    };
                    let relative = relative.replace(std::path::MAIN_SEPARATOR, "/");
                    match key_from_entry(&relative) {
                        Some(key) if key.starts_with(prefix) => keys.push(key),
                        _ => {}
                    }
                }
            }
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_path_encodes_last_segment() {
        assert_eq!(
            entry_path("token-password-acme-default"),
            "vaultctl/token/password/acme/ZGVmYXVsdA"
        );
    }

    #[test]
    fn entry_path_round_trips() {
        for key in [
            "token-password-acme-default",
            "token-password-acme-my%2Dprofile",
            "config-default-auth-client-secret",
            "single",
        ] {
            let path = entry_path(key);
            let relative = path.strip_prefix("vaultctl/").unwrap();
            assert_eq!(key_from_entry(relative).as_deref(), Some(key));
        }
    }

    #[test]
    fn foreign_entry_is_ignored() {
        assert_eq!(key_from_entry("email/gmail!"), None);
    }

    /// Stand-in for `pass` that keeps entries as plain files.
    #[cfg(unix)]
    const FAKE_PASS: &str = r#"
root="$PASSWORD_STORE_DIR"
case "$1" in
  ls) exit 0 ;;
  insert) mkdir -p "$root/$(dirname "$4")"; cat > "$root/$4.gpg" ;;
  show)
    if [ ! -f "$root/$2.gpg" ]; then
      echo "Error: $2 is not in the password store." >&2
      exit 1
    fi
    cat "$root/$2.gpg"; echo ;;
  rm) rm -rf "$root/$3.gpg" ;;
  *) exit 2 ;;
esac
"#;

    #[cfg(unix)]
    fn fake_helper(dir: &Path) -> PassHelper {
        let script = dir.join("fake-pass.sh");
        std::fs::write(&script, FAKE_PASS).unwrap();
        PassHelper::with_program("sh", vec![script.into_os_string()], dir.join("store"))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn insert_show_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let helper = fake_helper(dir.path());
        helper.check_initialized().await.unwrap();

        helper
            .add("token-password-acme-default", r#"{"accessToken":"at"}"#)
            .await
            .unwrap();
        helper
            .add("config-default-auth-password", "s3cret")
            .await
            .unwrap();

        assert!(
            dir.path()
                .join("store/vaultctl/token/password/acme/ZGVmYXVsdA.gpg")
                .exists()
        );
        assert_eq!(
            helper.get("config-default-auth-password").await.unwrap().as_deref(),
            Some("s3cret")
        );

        let keys = helper.list("token").await.unwrap();
        assert_eq!(keys, vec!["token-password-acme-default"]);

        helper.delete("token-password-acme-default").await.unwrap();
        assert!(helper.get("token-password-acme-default").await.unwrap().is_none());
        assert!(helper.list("token").await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_is_helper_error() {
        let dir = tempfile::tempdir().unwrap();
        let helper = PassHelper::with_program(
            dir.path().join("no-such-pass"),
            Vec::new(),
            dir.path(),
        );
        let err = helper.check_initialized().await.unwrap_err();
        assert!(matches!(err, Error::Helper(_)), "got: {err}");
    }
}
