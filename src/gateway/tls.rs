//! Per-handshake TLS configuration.
//!
//! Every accepted socket gets its own `rustls::ServerConfig`, assembled after
//! the ClientHello has been read:
//!
//! ```text
//! TCP accept
//!   → LazyConfigAcceptor reads ClientHello
//!   → trusted_client_authorities()  (fresh snapshot)
//!   → ServerConfig { TLS 1.2+1.3, ALPN http/1.1+h2, optional client auth }
//!   → KeyserverCertResolver → server_certificate(handshake)
//!   → TlsConnectionInfo attached to every request on the connection
//! ```
//!
//! Client certificates are requested but never required. A certificate that
//! does not chain to the trusted pool still completes the handshake; the
//! outcome is recorded in [`ClientCertificate::verified`] and left for the
//! keyserver to act on. Proof of key possession is always enforced.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

use crate::keyserver::{HandshakeInfo, Keyserver};
use crate::mtls::CertIdentity;
use crate::{Error, Result};

/// ALPN protocols offered to clients.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"http/1.1", b"h2"];

/// Accepted protocol versions; anything older fails the handshake.
pub static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

// ─────────────────────────────────────────────────────────────────────────────
// Connection metadata
// ─────────────────────────────────────────────────────────────────────────────

/// A certificate presented by the client.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    /// Presented chain, leaf first.
    pub chain: Vec<CertificateDer<'static>>,
    /// Whether the chain validated against the trusted client authorities.
    pub verified: bool,
    /// Parsed subject fields of the leaf, if it could be parsed.
    pub identity: Option<CertIdentity>,
}

/// Per-connection TLS facts, available as a request extension.
#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
    /// Remote socket address.
    pub peer_addr: SocketAddr,
    /// Negotiated protocol version.
    pub protocol_version: Option<rustls::ProtocolVersion>,
    /// Negotiated ALPN protocol.
    pub alpn: Option<Vec<u8>>,
    /// Client certificate, when one was presented.
    pub client_certificate: Option<ClientCertificate>,
}

impl TlsConnectionInfo {
    /// Client certificate that chained to a trusted authority.
    #[must_use]
    pub fn verified_client(&self) -> Option<&ClientCertificate> {
        self.client_certificate.as_ref().filter(|c| c.verified)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

/// Complete the TLS handshake on an accepted socket.
///
/// # Errors
///
/// Returns an error if the ClientHello is unreadable, the protocol version is
/// below TLS 1.2, the keyserver cannot supply a certificate, or any other
/// handshake step fails. The error only concerns this connection.
pub async fn accept(
    keyserver: &Arc<dyn Keyserver>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(TlsStream<TcpStream>, TlsConnectionInfo)> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .map_err(|e| Error::Tls(format!("Failed to read ClientHello: {e}")))?;

    let verifier = OptionalClientVerifier::new(keyserver.trusted_client_authorities())?;
    let config = server_config(Arc::clone(keyserver), Arc::clone(&verifier))?;

    let tls = start
        .into_stream(config)
        .await
        .map_err(|e| Error::Tls(format!("Handshake failed: {e}")))?;

    let info = {
        let (_, conn) = tls.get_ref();
        let client_certificate = conn
            .peer_certificates()
            .filter(|chain| !chain.is_empty())
            .map(|chain| verifier.inspect(chain));
        TlsConnectionInfo {
            peer_addr,
            protocol_version: conn.protocol_version(),
            alpn: conn.alpn_protocol().map(<[u8]>::to_vec),
            client_certificate,
        }
    };

    Ok((tls, info))
}

/// Build the server configuration for one handshake.
///
/// # Errors
///
/// Returns [`Error::Tls`] if the protocol versions are not supported by the
/// crypto provider.
pub fn server_config(
    keyserver: Arc<dyn Keyserver>,
    verifier: Arc<OptionalClientVerifier>,
) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(KeyserverCertResolver { keyserver }));

    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Process-wide provider if one was installed, aws-lc-rs otherwise.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Server certificate resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Asks the keyserver for the server identity on every handshake.
pub struct KeyserverCertResolver {
    keyserver: Arc<dyn Keyserver>,
}

impl fmt::Debug for KeyserverCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyserverCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for KeyserverCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let handshake = HandshakeInfo::from_client_hello(&client_hello);
        match self.keyserver.server_certificate(&handshake) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(sni = ?handshake.server_name, error = %e, "No server certificate for handshake");
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate verification
// ─────────────────────────────────────────────────────────────────────────────

/// Offers client authentication without requiring or enforcing it.
///
/// Chain validation is delegated to a `WebPkiClientVerifier`; a failure is
/// logged and the handshake continues. Signature checks are delegated as-is
/// so a client can never claim a certificate whose key it does not hold.
pub struct OptionalClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl OptionalClientVerifier {
    /// Build a verifier over a trust store snapshot.
    ///
    /// An empty store still offers client authentication; every presented
    /// certificate is then reported unverified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if the store cannot back a WebPKI verifier.
    pub fn new(roots: Arc<rustls::RootCertStore>) -> Result<Arc<Self>> {
        let inner = if roots.is_empty() {
            Arc::new(RejectAllVerifier::new()) as Arc<dyn ClientCertVerifier>
        } else {
            WebPkiClientVerifier::builder_with_provider(roots, crypto_provider())
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?
        };
        Ok(Arc::new(Self { inner }))
    }

    /// Classify a presented chain for the request layer.
    #[must_use]
    pub fn inspect(&self, chain: &[CertificateDer<'_>]) -> ClientCertificate {
        let owned: Vec<CertificateDer<'static>> =
            chain.iter().map(|c| c.clone().into_owned()).collect();
        let verified = self.chain_is_trusted(&owned);
        let identity = owned
            .first()
            .and_then(|leaf| match CertIdentity::from_der(leaf) {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!(error = %e, "Client certificate subject unreadable");
                    None
                }
            });
        ClientCertificate {
            chain: owned,
            verified,
            identity,
        }
    }

    fn chain_is_trusted(&self, chain: &[CertificateDer<'_>]) -> bool {
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return false;
        };
        self.inner
            .verify_client_cert(end_entity, intermediates, UnixTime::now())
            .is_ok()
    }
}

impl fmt::Debug for OptionalClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionalClientVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for OptionalClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        if let Err(e) = self.inner.verify_client_cert(end_entity, intermediates, now) {
            debug!(error = %e, "Client certificate not trusted; continuing unauthenticated");
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Stand-in used when no client authority is trusted yet.
///
/// Reports every chain as untrusted while still checking signatures.
#[derive(Debug)]
struct RejectAllVerifier {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl RejectAllVerifier {
    fn new() -> Self {
        Self {
            algorithms: crypto_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for RejectAllVerifier {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::UnknownIssuer,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::{CaParams, CertGenerator, LeafCertParams, parse_certs, root_store_from};

    fn ca(cn: &str) -> crate::mtls::GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn,
            validity_days: 30,
        })
        .unwrap()
    }

    fn client_chain(ca: &crate::mtls::GeneratedCert, cn: &str) -> Vec<CertificateDer<'static>> {
        let leaf = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn,
                ou: Some("nodes"),
                san_dns: vec![format!("{cn}.local")],
                san_uris: vec![],
                validity_days: 30,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        parse_certs(leaf.cert_pem.as_bytes()).unwrap()
    }

    fn verifier_trusting(ca: &crate::mtls::GeneratedCert) -> Arc<OptionalClientVerifier> {
        let roots = root_store_from(parse_certs(ca.cert_pem.as_bytes()).unwrap()).unwrap();
        OptionalClientVerifier::new(Arc::new(roots)).unwrap()
    }

    #[test]
    fn client_auth_is_offered_but_not_mandatory() {
        let verifier = verifier_trusting(&ca("Trusted"));
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
    }

    #[test]
    fn trusted_chain_is_marked_verified() {
        // GIVEN: a client cert issued by the trusted CA
        let trusted = ca("Trusted");
        let verifier = verifier_trusting(&trusted);
        // WHEN: inspecting the chain
        let cert = verifier.inspect(&client_chain(&trusted, "worker-1"));
        // THEN: verified, with identity parsed
        assert!(cert.verified);
        assert_eq!(
            cert.identity.unwrap().common_name.as_deref(),
            Some("worker-1")
        );
    }

    #[test]
    fn untrusted_chain_is_accepted_but_unverified() {
        // GIVEN: a client cert from a foreign CA
        let verifier = verifier_trusting(&ca("Trusted"));
        let chain = client_chain(&ca("Rogue"), "intruder");
        // WHEN: the handshake-time check runs
        let (leaf, rest) = chain.split_first().unwrap();
        let outcome = verifier.verify_client_cert(leaf, rest, UnixTime::now());
        // THEN: the handshake is not aborted, but the request layer sees it as unverified
        assert!(outcome.is_ok());
        assert!(!verifier.inspect(&chain).verified);
    }

    #[test]
    fn empty_trust_store_reports_everything_unverified() {
        let verifier = OptionalClientVerifier::new(Arc::new(rustls::RootCertStore::empty())).unwrap();
        let chain = client_chain(&ca("Any"), "worker-2");
        assert!(verifier.offer_client_auth());
        assert!(!verifier.inspect(&chain).verified);
    }

    #[test]
    fn empty_chain_is_never_trusted() {
        let verifier = verifier_trusting(&ca("Trusted"));
        assert!(!verifier.chain_is_trusted(&[]));
    }

    #[test]
    fn verified_client_filters_unverified_certificates() {
        let info = TlsConnectionInfo {
            peer_addr: "127.0.0.1:1".parse().unwrap(),
            protocol_version: None,
            alpn: None,
            client_certificate: Some(ClientCertificate {
                chain: vec![],
                verified: false,
                identity: None,
            }),
        };
        assert!(info.verified_client().is_none());
    }

    #[test]
    fn alpn_offers_http1_then_h2() {
        assert_eq!(ALPN_PROTOCOLS[0], b"http/1.1");
        assert_eq!(ALPN_PROTOCOLS[1], b"h2");
    }
}
