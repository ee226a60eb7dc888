//! Key material loading
//!
//! The proxy owns one RSA keypair, carried as a PEM PKCS#8 private key and a
//! self-signed X.509 certificate. From those two files four views are
//! derived at startup: the OAEP decryptor and RS256 signer (private key),
//! and the OAEP encryptor and RS256 verifier (certificate public key).
//! Everything is immutable after load and safe to share across requests.

use std::fmt;
use std::fs;
use std::path::Path;

use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use x509_parser::pem::parse_x509_pem;

use crate::{Error, Result};

/// The proxy's cryptographic identity.
pub struct KeyMaterial {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    signing_key: EncodingKey,
    verifying_key: DecodingKey,
    certificate_pem: Vec<u8>,
}

impl KeyMaterial {
    /// Load key material from a PEM PKCS#8 private key file and a PEM X.509
    /// certificate file.
    ///
    /// # Errors
    ///
    /// Fails fast if either file is unreadable or malformed, or if the
    /// certificate does not carry an RSA public key.
    pub fn from_files(private_key_file: &Path, certificate_file: &Path) -> Result<Self> {
        let private_pem = fs::read_to_string(private_key_file).map_err(|e| {
            Error::Keys(format!(
                "cannot read private key {}: {e}",
                private_key_file.display()
            ))
        })?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&private_pem).map_err(|e| {
            Error::Keys(format!(
                "{} is not a PEM PKCS#8 RSA private key: {e}",
                private_key_file.display()
            ))
        })?;
        let signing_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| Error::Keys(format!("cannot derive RS256 signer: {e}")))?;

        let certificate_pem = fs::read(certificate_file).map_err(|e| {
            Error::Keys(format!(
                "cannot read certificate {}: {e}",
                certificate_file.display()
            ))
        })?;
        let (public_key, verifying_key) = certificate_public_key(&certificate_pem)
            .map_err(|e| {
                Error::Keys(format!(
                    "{} is not a usable X.509 certificate: {e}",
                    certificate_file.display()
                ))
            })?;

        Ok(Self {
            private_key,
            public_key,
            signing_key,
            verifying_key,
            certificate_pem,
        })
    }

    /// OAEP decryptor for the `token` claim.
    #[must_use]
    pub fn decrypt_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// OAEP encryptor (the certificate's public key).
    #[must_use]
    pub fn encrypt_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// RS256 signer for minted tokens.
    #[must_use]
    pub fn signer(&self) -> &EncodingKey {
        &self.signing_key
    }

    /// RS256 verifier derived from the certificate.
    #[must_use]
    pub fn verifier(&self) -> &DecodingKey {
        &self.verifying_key
    }

    /// Raw PEM bytes of the certificate.
    #[must_use]
    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }
}

// Key material never appears in logs or debug output.
impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Extract the RSA public key from a PEM certificate, in both the `rsa` and
/// `jsonwebtoken` representations.
fn certificate_public_key(pem: &[u8]) -> std::result::Result<(RsaPublicKey, DecodingKey), String> {
    let (_, parsed) = parse_x509_pem(pem).map_err(|e| e.to_string())?;
    let certificate = parsed.parse_x509().map_err(|e| e.to_string())?;
    // For RSA keys the SubjectPublicKeyInfo bit string holds PKCS#1 DER.
    let pkcs1_der = certificate.public_key().subject_public_key.data.as_ref();
    let public_key = RsaPublicKey::from_pkcs1_der(pkcs1_der).map_err(|e| e.to_string())?;
    let verifying_key = DecodingKey::from_rsa_der(pkcs1_der);
    Ok((public_key, verifying_key))
}
