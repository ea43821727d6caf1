//! PEM collaborator: reads the server's RSA private key and certificate.
//! The core only ever sees the parsed signing key and the raw DER.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use sha2::Sha256;

use crate::err::Error;

/// Long-lived server credentials, shared read-only by every connection.
pub struct Identity {
    pub signer: SigningKey<Sha256>,
    pub cert_der: Vec<u8>,
}

impl Identity {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let cert_der = pem_block(&cert_pem, "CERTIFICATE").ok_or_else(|| {
            Error::Key(format!("no CERTIFICATE block in {}", cert_path.display()))
        })?;

        let key_pem = fs::read_to_string(key_path)?;
        let key = if key_pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(&key_pem).map_err(|e| Error::Key(e.to_string()))?
        } else {
            RsaPrivateKey::from_pkcs8_pem(&key_pem).map_err(|e| Error::Key(e.to_string()))?
        };

        Ok(Self::from_parts(key, cert_der))
    }

    pub fn from_parts(key: RsaPrivateKey, cert_der: Vec<u8>) -> Self {
        Identity {
            signer: SigningKey::<Sha256>::new(key),
            cert_der,
        }
    }
}

/// Decodes the first PEM block carrying the given label.
fn pem_block(pem: &str, label: &str) -> Option<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let start = pem.find(&begin)? + begin.len();
    let stop = pem[start..].find(&end)? + start;

    let body: String = pem[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(body).ok()
}
