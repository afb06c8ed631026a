//! Windows Credential Manager keychain helper
//!
//! Each value is wrapped in an envelope carrying the `Vault Token` label so
//! entries written by other programs under the same target are ignored.
//! Credential Manager cannot be enumerated through `keyring`, so the helper
//! keeps its own index of keys in a separate entry.

use std::collections::BTreeSet;

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::kind::StoreKind;
use crate::secure::KeychainHelper;
use crate::BoxFuture;

/// Label attached to every credential this tool writes.
pub const CREDENTIAL_LABEL: &str = "Vault Token";

const SERVICE: &str = "vaultctl";
const INDEX_KEY: &str = "vaultctl-index";

#[derive(Serialize, Deserialize)]
struct Envelope {
    label: String,
    value: String,
}

#[derive(Default)]
pub struct WinCredHelper;

impl WinCredHelper {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> Result<Entry> {
        Entry::new(SERVICE, key).map_err(map_keyring_error)
    }

    fn read_raw(key: &str) -> Result<Option<String>> {
        match Self::entry(key)?.get_password() {
            Ok(raw) => Ok(Some(raw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    fn read_index() -> Result<BTreeSet<String>> {
        let Some(raw) = Self::read_raw(INDEX_KEY)? else {
            return Ok(BTreeSet::new());
        };
        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(_) => return Ok(BTreeSet::new()),
        };
        if envelope.label != CREDENTIAL_LABEL {
            return Ok(BTreeSet::new());
        }
        serde_json::from_str(&envelope.value)
            .map_err(|e| Error::Serialization(format!("decoding credential index: {e}")))
    }

    fn write_index(index: &BTreeSet<String>) -> Result<()> {
        let value = serde_json::to_string(index)
            .map_err(|e| Error::Serialization(format!("encoding credential index: {e}")))?;
        write_envelope(INDEX_KEY, value)
    }
}

fn write_envelope(key: &str, value: String) -> Result<()> {
    let envelope = Envelope {
        label: CREDENTIAL_LABEL.to_owned(),
        value,
    };
    let raw = serde_json::to_string(&envelope)
        .map_err(|e| Error::Serialization(format!("encoding {key}: {e}")))?;
    WinCredHelper::entry(key)?
        .set_password(&raw)
        .map_err(map_keyring_error)
}

fn map_keyring_error(e: keyring::Error) -> Error {
    Error::Helper(format!("credential manager: {e}"))
}

impl KeychainHelper for WinCredHelper {
    fn kind(&self) -> StoreKind {
        StoreKind::WinCred
    }

    fn add<'a>(&'a self, key: &'a str, secret: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            write_envelope(key, secret.to_owned())?;
            let mut index = Self::read_index()?;
            if index.insert(key.to_owned()) {
                Self::write_index(&index)?;
            }
            debug!(key, "stored entry in credential manager");
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let Some(raw) = Self::read_raw(key)? else {
                return Ok(None);
            };
            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) if envelope.label == CREDENTIAL_LABEL => Ok(Some(envelope.value)),
                _ => Ok(None),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match Self::entry(key)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(map_keyring_error(e)),
            }
            let mut index = Self::read_index()?;
            if index.remove(key) {
                Self::write_index(&index)?;
            }
            debug!(key, "deleted entry from credential manager");
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            Ok(Self::read_index()?
                .into_iter()
                .filter(|key| key.starts_with(prefix))
                .collect())
        })
    }
}
