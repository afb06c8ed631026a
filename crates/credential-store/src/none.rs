//! Store that persists nothing
//!
//! Selected with `store.type = "none"`: every call succeeds, reads always
//! miss, so each command authenticates from scratch.

use serde_json::Value;

use crate::error::Result;
use crate::kind::StoreKind;
use crate::{BoxFuture, CredentialStore};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoneStore;

impl CredentialStore for NoneStore {
    fn kind(&self) -> StoreKind {
        StoreKind::None
    }

    fn store<'a>(&'a self, _key: &'a str, _value: &'a Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async { Ok(None) })
    }

    fn delete<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn list<'a>(&'a self, _prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}
