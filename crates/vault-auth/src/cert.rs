//! Certificate challenge/response
//!
//! The server encrypts a random challenge to the client certificate's public
//! key. We decrypt it with the matching private key (RSA-OAEP, SHA-512) and
//! send the plaintext back, base64 encoded, in the `certificate` grant.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tracing::debug;

use crate::client::VaultClient;
use crate::constants::CERT_AUTH_PATH;
use crate::error::{Error, Result};

#[derive(Serialize)]
struct ChallengeRequest<'a> {
    client_certificate: &'a str,
}

#[derive(Deserialize)]
struct ChallengeResponse {
    cert_challenge_id: String,
    encrypted: String,
}

/// Answer to a certificate challenge, ready for the token request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertChallenge {
    pub challenge_id: String,
    pub decrypted: String,
}

/// Parse a base64 encoded PEM `RSA PRIVATE KEY` (PKCS#1).
pub fn parse_private_key(encoded: &str) -> Result<RsaPrivateKey> {
    let pem = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Crypto(format!("unable to read private key: {e}")))?;
    let pem = String::from_utf8(pem)
        .map_err(|e| Error::Crypto(format!("unable to read private key: {e}")))?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| Error::Crypto(format!("unable to parse private key: {e}")))
}

/// Decrypt a base64 challenge and re-encode the plaintext as base64.
pub fn decrypt_challenge(key: &RsaPrivateKey, encrypted: &str) -> Result<String> {
    let ciphertext = STANDARD
        .decode(encrypted.trim())
        .map_err(|e| Error::Protocol(format!("unable to read challenge: {e}")))?;
    let plaintext = key
        .decrypt(Oaep::new::<Sha512>(), &ciphertext)
        .map_err(|e| Error::Crypto(format!("unable to decrypt challenge: {e}")))?;
    Ok(STANDARD.encode(plaintext))
}

/// Request a challenge for `certificate` and answer it with `private_key`.
///
/// The key is parsed before any request goes out.
pub async fn answer_challenge(
    client: &VaultClient,
    certificate: &str,
    private_key: &str,
) -> Result<CertChallenge> {
    let key = parse_private_key(private_key)?;

    debug!("requesting certificate challenge");
    let response: ChallengeResponse = client
        .post_json(
            CERT_AUTH_PATH,
            &ChallengeRequest {
                client_certificate: certificate,
            },
        )
        .await?;

    let decrypted = decrypt_challenge(&key, &response.encrypted)?;
    Ok(CertChallenge {
        challenge_id: response.cert_challenge_id,
        decrypted,
    })
}
