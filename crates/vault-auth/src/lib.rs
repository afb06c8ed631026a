//! Vault authentication and credential lifecycle
//!
//! Turns a configured auth method into an access token for the vault API,
//! reusing cached tokens where possible. The credential store, the key file
//! cipher and the HTTP client are injected, so the crate runs the same
//! against a real tenant and a local test server.
//!
//! Token flow (`Authenticator::get_token`):
//! 1. Cached token for `{method, tenant, profile}` if still valid
//! 2. Cached refresh token if inside its 720h window
//! 3. Fresh grant built by the method (password, client credentials,
//!    certificate challenge, OIDC browser login, AWS/Azure/GCP identity)
//! 4. Result persisted through `credential_store`

pub mod authenticator;
pub mod cache;
pub mod cert;
pub mod cipher;
pub mod client;
pub mod cloud;
pub mod constants;
pub mod error;
pub mod grant;
pub mod identity;
pub mod method;
pub mod oidc;
pub mod token;

pub use authenticator::{AuthSettings, Authenticator};
pub use cache::TokenCache;
pub use cipher::SecretCipher;
pub use client::{VaultClient, VaultEndpoint};
pub use cloud::gcp::{GcpAuthType, GcpSettings};
pub use error::{Error, ErrorKind, Result};
pub use grant::GrantRequest;
pub use identity::subject_from_token;
pub use method::AuthMethod;
pub use oidc::{Browser, OidcLogin};
pub use token::TokenRecord;
