//! Reading claims out of an access token without verifying it
//!
//! Only used for display (`whoami`). The vault is the one that checks
//! signatures.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
}

/// Subject claim of a JWT access token. Signature is not checked.
pub fn subject_from_token(token: &str) -> Result<String> {
    jsonwebtoken::decode_header(token)
        .map_err(|e| Error::Protocol(format!("access token is not a JWT: {e}")))?;

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Protocol("access token is not a JWT".into()))?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Protocol(format!("invalid token payload: {e}")))?;
    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|e| Error::Protocol(format!("invalid token claims: {e}")))?;

    if claims.sub.is_empty() {
        return Err(Error::Protocol("access token has no subject".into()));
    }
    Ok(claims.sub)
}
