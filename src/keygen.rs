//! Key material generation
//!
//! Produces the three files the proxy's crypto rests on: a 2048-bit RSA
//! private key (PEM PKCS#8), the matching public key (PEM SPKI), and a
//! self-signed X.509 certificate whose CN is the proxy's public address.
//! Run once per deployment via `magicproxy generate-keys`.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use tracing::info;

use crate::config::Config;
use crate::{Error, Result};

const KEY_BITS: usize = 2048;
const CERT_VALIDITY_DAYS: i64 = 365 * 10;

/// Generate the proxy keypair and certificate at the configured locations.
pub fn generate_keys(config: &Config) -> Result<()> {
    let common_name = url::Url::parse(&config.public_access)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .ok_or_else(|| {
            Error::Config(format!(
                "public_access {:?} is not a URL with a host; needed as certificate CN",
                config.public_access
            ))
        })?;

    write_key_material(
        &config.private_key_location(),
        &config.public_key_location(),
        &config.public_certificate_location(),
        &common_name,
    )?;

    info!(
        private_key = %config.private_key_location().display(),
        public_key = %config.public_key_location().display(),
        certificate = %config.public_certificate_location().display(),
        "Generated key material"
    );
    Ok(())
}

/// Generate an RSA keypair and a self-signed certificate, writing all three
/// PEM files. Parent directories are created as needed.
pub fn write_key_material(
    private_key_path: &Path,
    public_key_path: &Path,
    certificate_path: &Path,
    common_name: &str,
) -> Result<()> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| Error::Keys(format!("RSA key generation failed: {e}")))?;

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Keys(format!("cannot encode private key: {e}")))?;
    let public_pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Keys(format!("cannot encode public key: {e}")))?;

    let certificate_pem = self_signed_certificate(&private_pem, common_name)?;

    for path in [private_key_path, public_key_path, certificate_path] {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }
    fs::write(private_key_path, private_pem.as_bytes())?;
    fs::write(public_key_path, public_pem)?;
    fs::write(certificate_path, certificate_pem)?;
    Ok(())
}

/// Self-sign a certificate for the given RSA private key.
fn self_signed_certificate(private_key_pem: &str, common_name: &str) -> Result<String> {
    let key_pair = KeyPair::from_pem_and_sign_algo(private_key_pem, &PKCS_RSA_SHA256)
        .map_err(|e| Error::Keys(format!("cannot load generated key for signing: {e}")))?;

    let mut params = CertificateParams::new(Vec::new())
        .map_err(|e| Error::Keys(format!("cannot build certificate params: {e}")))?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(CERT_VALIDITY_DAYS);

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Keys(format!("cannot self-sign certificate: {e}")))?;
    Ok(certificate.pem())
}
