//! Ephemeral server key provisioning.
//!
//! Before a durable signing identity exists (first boot, or a keyserver
//! configured without a server certificate), the gateway still needs some key
//! to present during the TLS handshake. [`generate_server_key`] produces a
//! throwaway RSA key of the authority's strength. The key lives only in memory
//! and is handed once to the keyserver factory.

use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Bit strength of the cluster authorities' keys.
pub const AUTHORITY_BITS: usize = 4096;

/// Strength of the temporary server key; always matches the authorities.
pub const TEMPORARY_CERTIFICATE_BITS: usize = AUTHORITY_BITS;

/// PEM label of the encoded key.
pub const PEM_LABEL: &str = "RSA PRIVATE KEY";

/// A disposable private key, PKCS#1 PEM encoded.
///
/// The PEM text is wiped from memory when the value is dropped.
pub struct BootstrapKey {
    pem: Zeroizing<String>,
    bits: usize,
}

impl BootstrapKey {
    /// The `RSA PRIVATE KEY` PEM block.
    #[must_use]
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Modulus size the key was generated with.
    #[must_use]
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Decode the PEM back into an RSA private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyGeneration`] if the PEM is not a PKCS#1 RSA key.
    pub fn decode(&self) -> Result<RsaPrivateKey> {
        RsaPrivateKey::from_pkcs1_pem(&self.pem)
            .map_err(|e| Error::KeyGeneration(format!("Failed to decode bootstrap key: {e}")))
    }

    /// Re-encode the key as PKCS#8 PEM, the form certificate tooling expects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyGeneration`] if decoding or re-encoding fails.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>> {
        self.decode()?
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::KeyGeneration(format!("Failed to encode PKCS#8 key: {e}")))
    }
}

impl std::fmt::Debug for BootstrapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapKey")
            .field("bits", &self.bits)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh RSA key of `bits` strength from the OS random source.
///
/// No retry is attempted; callers treat failure as fatal to startup. This is
/// CPU bound for large keys, so async callers should run it on the blocking
/// pool.
///
/// # Errors
///
/// Returns [`Error::KeyGeneration`] if generation or encoding fails.
pub fn generate_server_key(bits: usize) -> Result<BootstrapKey> {
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::KeyGeneration(format!("Failed to encode key: {e}")))?;

    tracing::debug!(bits = key.n().bits(), "Generated temporary server key");

    Ok(BootstrapKey { pem, bits })
}
