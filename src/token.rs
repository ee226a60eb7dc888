//! Magic token minting and decoding
//!
//! A magic token is a compact RS256 JWT whose `token` claim carries the
//! upstream API secret, RSA-OAEP-encrypted (MGF1-SHA256, SHA-256, empty
//! label) to the proxy's own public key. The signature binds the hidden
//! credential to a capability description: either named `scopes` or an
//! inline `allowed` list, never both.
//!
//! Tokens stay valid for five years and cannot be revoked; the proxy keeps
//! no per-token state, so validation is purely cryptographic and temporal.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Header, Validation};
use rsa::Oaep;
use rsa::sha2::Sha256;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::keys::KeyMaterial;
use crate::scopes::PermissionSpec;
use crate::{Error, Result};

/// How long a minted token stays valid: five years, matching the proxy's
/// no-revocation design.
pub const VALIDITY_SECS: i64 = 365 * 5 * 24 * 60 * 60;

/// Claims carried by a magic token.
///
/// On the wire `token` is the base64 OAEP ciphertext of the upstream secret;
/// [`decode`] replaces it with the plaintext before returning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issued-at, Unix seconds.
    pub iat: i64,
    /// Expiry, Unix seconds.
    pub exp: i64,
    /// The upstream secret (encrypted on the wire, plaintext after decode).
    pub token: String,
    /// Named scopes configured on the proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Inline capability list embedded in the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<PermissionSpec>>,
}

/// Mint a signed magic token hiding `upstream_secret`.
///
/// The secret is encrypted with the proxy's *public* key so that only the
/// proxy's private key can recover it; the claims are then signed with that
/// private key.
pub fn mint(
    keys: &KeyMaterial,
    upstream_secret: &str,
    scopes: Option<Vec<String>>,
    allowed: Option<Vec<PermissionSpec>>,
) -> Result<String> {
    let mut rng = rand::rngs::OsRng;
    let ciphertext = keys
        .encrypt_key()
        .encrypt(&mut rng, Oaep::new::<Sha256>(), upstream_secret.as_bytes())
        .map_err(|e| Error::Keys(format!("OAEP encryption failed: {e}")))?;

    let issued_at = Utc::now().timestamp();
    let claims = Claims {
        iat: issued_at,
        exp: issued_at + VALIDITY_SECS,
        token: BASE64.encode(ciphertext),
        scopes,
        allowed,
    };

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, keys.signer())
        .map_err(|e| Error::Keys(format!("token signing failed: {e}")))
}

/// Verify a magic token and recover its claims.
///
/// The JWT signature is checked against the certificate's public key and
/// expired tokens are rejected; the `token` claim is then decrypted back to
/// the upstream secret.
///
/// # Errors
///
/// [`Error::ExpiredToken`] for a token past `exp`; [`Error::InvalidToken`]
/// for every other failure (bad signature, malformed envelope, undecryptable
/// claim).
pub fn decode(keys: &KeyMaterial, token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::RS256);
    // Five-year tokens need no clock-skew leeway.
    validation.leeway = 0;

    let data =
        jsonwebtoken::decode::<Claims>(token, keys.verifier(), &validation).map_err(|e| {
            debug!(error = %e, "Magic token rejected");
            match e.kind() {
                ErrorKind::ExpiredSignature => Error::ExpiredToken,
                _ => Error::InvalidToken,
            }
        })?;

    let mut claims = data.claims;
    let ciphertext = BASE64.decode(&claims.token).map_err(|e| {
        debug!(error = %e, "Encrypted claim is not valid base64");
        Error::InvalidToken
    })?;
    let secret = keys
        .decrypt_key()
        .decrypt(Oaep::new::<Sha256>(), &ciphertext)
        .map_err(|e| {
            debug!(error = %e, "Encrypted claim does not decrypt");
            Error::InvalidToken
        })?;
    claims.token = String::from_utf8(secret).map_err(|_| Error::InvalidToken)?;

    Ok(claims)
}
