//! Client certificate identity extraction.
//!
//! Parses an X.509 DER-encoded certificate presented during the handshake and
//! extracts the subject fields a keyserver authorises against: Common Name,
//! Organisational Unit, SAN DNS names and SAN URIs.

use serde::Serialize;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields of a client certificate.
///
/// All fields are optional because not every certificate uses every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// First Organisational Unit (OU) in the subject.
    pub organizational_unit: Option<String>,

    /// Subject Alternative Name, DNS entries.
    pub san_dns_names: Vec<String>,

    /// Subject Alternative Name, URI entries.
    pub san_uris: Vec<String>,

    /// Hex serial number as printed by the issuer.
    pub serial: String,

    /// Label for logs: CN, else the first DNS SAN, else `"<unknown>"`.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Tls(format!("Failed to parse client certificate: {e}")))?;

        let common_name = extract_cn(&cert);
        let organizational_unit = extract_ou(&cert);
        let (san_dns_names, san_uris) = extract_sans(&cert);
        let display_name = build_display_name(common_name.as_ref(), &san_dns_names);

        Ok(Self {
            common_name,
            organizational_unit,
            san_dns_names,
            san_uris,
            serial: cert.raw_serial_as_string(),
            display_name,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_ou(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Returns `(dns_names, uris)` from the SAN extension.
fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut dns_names = Vec::new();
    let mut uris = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                GeneralName::URI(uri) => uris.push((*uri).to_owned()),
                _ => {}
            }
        }
    }

    (dns_names, uris)
}

fn build_display_name(cn: Option<&String>, san_dns: &[String]) -> String {
    cn.or_else(|| san_dns.first())
        .map_or("<unknown>", String::as_str)
        .to_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
