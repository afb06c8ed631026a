//! Shared types for the vaultctl workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
