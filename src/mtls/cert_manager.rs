//! Certificate management: PEM loading, rustls key material and generation.
//!
//! Provides:
//! - [`load_certs`] / [`load_private_key`]: PEM file loading
//! - [`root_store_from`]: trust store from parsed CA certificates
//! - [`certified_key`]: turn a chain and key into a rustls `CertifiedKey`
//! - [`CertGenerator`]: `rcgen`-backed cert generation for self-signed
//!   bootstrap identities and the `keygateway dev-pki` command
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Ia5String, KeyPair,
    SanType, date_time_ymd,
};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    parse_certs(&pem_data)
        .map_err(|e| Error::Config(format!("'{}': {e}", path.display())))
}

/// Parse every certificate in a PEM buffer.
///
/// # Errors
///
/// Returns an error if the buffer is malformed or holds no certificate.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config("No certificates found".to_string()));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key, or
/// the key format is unsupported.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| {
            Error::Config(format!(
                "Failed to parse private key from '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| Error::Config(format!("No private key found in '{}'", path.display())))
}

/// Build a trust store from already-parsed CA certificates.
///
/// # Errors
///
/// Returns an error if a certificate is not a usable trust anchor.
pub fn root_store_from(
    ca_certs: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in ca_certs {
        root_store
            .add(cert)
            .map_err(|e| Error::Config(format!("Failed to add CA cert to trust store: {e}")))?;
    }
    Ok(root_store)
}

/// Pair a certificate chain with its private key for serving.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the key type is unsupported or does not match the
/// leaf certificate.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let certified = CertifiedKey::from_der(chain, key, &provider)
        .map_err(|e| Error::Tls(format!("Unusable server certificate (cert/key mismatch?): {e}")))?;
    Ok(Arc::new(certified))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate generation
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the root CA (e.g. `"Cluster Client CA"`).
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for generating a leaf certificate (server or client).
#[derive(Debug)]
pub struct LeafCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Organisational Unit (optional).
    pub ou: Option<&'a str>,
    /// Subject Alternative Names, DNS entries.
    pub san_dns: Vec<String>,
    /// Subject Alternative Names, URI entries.
    pub san_uris: Vec<String>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl GeneratedCert {
    /// Parse the PEM pair into rustls serving material.
    ///
    /// # Errors
    ///
    /// Returns an error if either PEM block is malformed.
    pub fn to_certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let chain = parse_certs(self.cert_pem.as_bytes())?;
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| Error::Config(format!("Failed to parse private key: {e}")))?
            .ok_or_else(|| Error::Config("No private key in generated PEM".to_string()))?;
        certified_key(chain, key)
    }
}

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.not_after = validity_to_date(params.validity_days)?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Config(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue a leaf certificate (server or client) signed by `ca_cert_pem` /
    /// `ca_key_pem`.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA cert/key cannot be parsed, key generation
    /// fails, or certificate serialisation fails.
    pub fn issue_leaf(
        params: &LeafCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Config(format!("Failed to parse CA key: {e}")))?;

        let ca_cert_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
            .map_err(|e| Error::Config(format!("Failed to parse CA cert: {e}")))?;
        let ca_cert = ca_cert_params
            .self_signed(&ca_key)
            .map_err(|e| Error::Config(format!("Failed to rebuild CA cert for signing: {e}")))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate leaf key: {e}")))?;

        let mut leaf_params = leaf_params(params.cn, params.ou, params.validity_days)?;
        leaf_params.subject_alt_names = san_list(&params.san_dns, &params.san_uris)?;

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .map_err(|e| Error::Config(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Self-sign a server certificate over an existing PKCS#8 key.
    ///
    /// Used to present the ephemeral bootstrap key before the authority has
    /// issued a durable identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be parsed, a host name is not a
    /// valid DNS SAN, or signing fails.
    pub fn self_signed_server(
        key_pem: &str,
        hostnames: &[String],
        validity_days: u32,
    ) -> Result<GeneratedCert> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Config(format!("Failed to parse server key: {e}")))?;

        let cn = hostnames.first().map_or("keyserver", String::as_str);
        let mut params = leaf_params(cn, None, validity_days)?;
        params.subject_alt_names = san_list(hostnames, &[])?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Config(format!("Self-signed cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key_pem.to_owned(),
        })
    }

    /// Write a [`GeneratedCert`] to disk.
    ///
    /// Writes `<stem>.crt` and `<stem>.key` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

fn leaf_params(cn: &str, ou: Option<&str>, validity_days: u32) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    if let Some(ou) = ou {
        dn.push(DnType::OrganizationalUnitName, ou);
    }
    params.distinguished_name = dn;
    params.not_after = validity_to_date(validity_days)?;
    Ok(params)
}

/// Host names that parse as IP addresses become IP SANs.
fn san_list(dns_names: &[String], uris: &[String]) -> Result<Vec<SanType>> {
    let mut sans: Vec<SanType> = Vec::new();
    for dns in dns_names {
        if let Ok(ip) = dns.parse::<std::net::IpAddr>() {
            sans.push(SanType::IpAddress(ip));
            continue;
        }
        let ia5 = Ia5String::try_from(dns.as_str())
            .map_err(|e| Error::Config(format!("Invalid DNS SAN '{dns}': {e}")))?;
        sans.push(SanType::DnsName(ia5));
    }
    for uri in uris {
        let ia5 = Ia5String::try_from(uri.as_str())
            .map_err(|e| Error::Config(format!("Invalid URI SAN '{uri}': {e}")))?;
        sans.push(SanType::URI(ia5));
    }
    Ok(sans)
}

/// Convert a validity period (days) into a future `OffsetDateTime` for `rcgen`.
fn validity_to_date(days: u32) -> Result<time::OffsetDateTime> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(future_secs).unwrap_or(i64::MAX),
    )
    .map_err(|e| Error::Config(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn: "Test CA",
            validity_days: 365,
        })
        .unwrap()
    }

    fn server_leaf(ca: &GeneratedCert) -> GeneratedCert {
        let params = LeafCertParams {
            cn: "keyserver.cluster.local",
            ou: None,
            san_dns: vec!["keyserver.cluster.local".to_string()],
            san_uris: vec![],
            validity_days: 90,
        };
        CertGenerator::issue_leaf(&params, &ca.cert_pem, &ca.key_pem).unwrap()
    }

    // ─── Generation ───────────────────────────────────────────────────────────

    #[test]
    fn init_ca_produces_valid_pem_cert_and_key() {
        let ca = test_ca();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn init_ca_generates_unique_keys_on_each_call() {
        assert_ne!(test_ca().key_pem, test_ca().key_pem);
    }

    #[test]
    fn issue_leaf_fails_with_invalid_ca_key() {
        let ca = test_ca();
        let params = LeafCertParams {
            cn: "node",
            ou: None,
            san_dns: vec!["node.local".to_string()],
            san_uris: vec![],
            validity_days: 30,
        };
        let result = CertGenerator::issue_leaf(&params, &ca.cert_pem, "not a pem key");
        assert!(result.is_err());
    }

    #[test]
    fn issue_leaf_rejects_invalid_dns_san() {
        let ca = test_ca();
        let params = LeafCertParams {
            cn: "node",
            ou: None,
            san_dns: vec!["bad\u{e9}name".to_string()],
            san_uris: vec![],
            validity_days: 30,
        };
        assert!(CertGenerator::issue_leaf(&params, &ca.cert_pem, &ca.key_pem).is_err());
    }

    #[test]
    fn ip_host_names_become_ip_sans() {
        let sans = san_list(&["127.0.0.1".to_string(), "ks.local".to_string()], &[]).unwrap();
        assert!(matches!(sans[0], SanType::IpAddress(_)));
        assert!(matches!(sans[1], SanType::DnsName(_)));
    }

    #[test]
    fn self_signed_server_reuses_given_key() {
        // GIVEN: an existing PKCS#8 key
        let key = KeyPair::generate().unwrap().serialize_pem();
        // WHEN: self-signing over it
        let cert =
            CertGenerator::self_signed_server(&key, &["keyserver.local".to_string()], 7).unwrap();
        // THEN: the key is carried through and the pair is servable
        assert_eq!(cert.key_pem, key);
        assert!(cert.to_certified_key().is_ok());
    }

    // ─── Serving material ─────────────────────────────────────────────────────

    #[test]
    fn generated_leaf_converts_to_certified_key() {
        let ca = test_ca();
        let leaf = server_leaf(&ca);
        let certified = leaf.to_certified_key().unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn certified_key_rejects_mismatched_pair() {
        let ca = test_ca();
        let leaf = server_leaf(&ca);
        let chain = parse_certs(leaf.cert_pem.as_bytes()).unwrap();
        // CA key does not belong to the leaf certificate
        let wrong_key = rustls_pemfile::private_key(&mut ca.key_pem.as_bytes())
            .unwrap()
            .unwrap();
        assert!(certified_key(chain, wrong_key).is_err());
    }

    #[test]
    fn root_store_holds_every_ca() {
        let a = parse_certs(test_ca().cert_pem.as_bytes()).unwrap();
        let b = parse_certs(test_ca().cert_pem.as_bytes()).unwrap();
        let store = root_store_from(a.into_iter().chain(b)).unwrap();
        assert_eq!(store.len(), 2);
    }

    // ─── File loading ─────────────────────────────────────────────────────────

    #[test]
    fn write_to_dir_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca();
        CertGenerator::write_to_dir(&ca, dir.path(), "ca").unwrap();

        let certs = load_certs(&dir.path().join("ca.crt")).unwrap();
        assert_eq!(certs.len(), 1);
        let key = load_private_key(&dir.path().join("ca.key")).unwrap();
        assert!(!key.secret_der().is_empty());
        let store = root_store_from(certs).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn load_certs_returns_error_for_missing_file() {
        let result = load_certs(Path::new("/nonexistent/path/ca.crt"));
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("Cannot read"));
    }

    #[test]
    fn parse_certs_rejects_empty_buffer() {
        assert!(parse_certs(b"").is_err());
    }

    #[test]
    fn load_private_key_returns_error_when_no_key_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert_only.pem");
        fs::write(&path, test_ca().cert_pem).unwrap();
        assert!(load_private_key(&path).is_err());
    }
}
