//! Shared helpers for the TLS integration tests
//!
//! Certificates are generated per test with `rcgen`; clients are plain
//! `tokio-rustls` connectors speaking raw HTTP/1.1.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use keyserver_gateway::mtls::{CaParams, CertGenerator, GeneratedCert, LeafCertParams, parse_certs};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// A CA plus a server leaf for `localhost`.
#[derive(Clone)]
pub struct Pki {
    pub ca: GeneratedCert,
    pub server: GeneratedCert,
}

impl Pki {
    pub fn new(ca_cn: &str) -> Self {
        let ca = CertGenerator::init_ca(&CaParams {
            cn: ca_cn,
            validity_days: 30,
        })
        .unwrap();
        let server = leaf(&ca, "localhost", vec!["localhost".to_string()]);
        Self { ca, server }
    }

    pub fn client(&self, cn: &str) -> GeneratedCert {
        leaf(&self.ca, cn, vec![format!("{cn}.nodes.local")])
    }

    pub fn ca_roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(self.ca.cert_pem.as_bytes()).unwrap() {
            roots.add(cert).unwrap();
        }
        roots
    }
}

pub fn leaf(ca: &GeneratedCert, cn: &str, san_dns: Vec<String>) -> GeneratedCert {
    CertGenerator::issue_leaf(
        &LeafCertParams {
            cn,
            ou: Some("nodes"),
            san_dns,
            san_uris: vec![],
            validity_days: 30,
        },
        &ca.cert_pem,
        &ca.key_pem,
    )
    .unwrap()
}

fn client_identity(cert: &GeneratedCert) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let chain = parse_certs(cert.cert_pem.as_bytes()).unwrap();
    let key = rustls_pemfile::private_key(&mut cert.key_pem.as_bytes())
        .unwrap()
        .unwrap();
    (chain, key)
}

/// Client options for one connection.
#[derive(Default)]
pub struct ClientOptions<'a> {
    pub trust: Option<&'a Pki>,
    pub identity: Option<&'a GeneratedCert>,
    pub tls12_only: bool,
    pub alpn: Vec<Vec<u8>>,
}

pub fn client_config(opts: &ClientOptions<'_>) -> ClientConfig {
    let versions: &[&rustls::SupportedProtocolVersion] = if opts.tls12_only {
        &[&rustls::version::TLS12]
    } else {
        &[&rustls::version::TLS13, &rustls::version::TLS12]
    };
    let builder = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(versions)
        .unwrap();
    let builder = match opts.trust {
        Some(pki) => builder.with_root_certificates(pki.ca_roots()),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert)),
    };
    let mut config = match opts.identity {
        Some(cert) => {
            let (chain, key) = client_identity(cert);
            builder.with_client_auth_cert(chain, key).unwrap()
        }
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols.clone_from(&opts.alpn);
    config
}

pub async fn connect(addr: SocketAddr, opts: &ClientOptions<'_>) -> std::io::Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(client_config(opts)));
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost").unwrap();
    tokio::time::timeout(TIMEOUT, connector.connect(name, tcp))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))?
}

/// Parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            line.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim())
        })
    }
}

/// Send one request with `Connection: close` and read the whole response.
pub async fn request(
    stream: &mut TlsStream<TcpStream>,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> HttpResponse {
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("Content-Length: 0\r\n\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let bytes = tokio::time::timeout(TIMEOUT, read_all(stream)).await.unwrap();
    let text = String::from_utf8(bytes).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    HttpResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

/// Send one request on a persistent connection and read exactly one response.
pub async fn request_keep_alive(stream: &mut TlsStream<TcpStream>, method: &str, path: &str) -> HttpResponse {
    let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::timeout(TIMEOUT, read_response(stream)).await.unwrap()
}

/// Read one response framed by its `Content-Length`.
async fn read_response<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> HttpResponse {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before the response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
    let mut response = HttpResponse {
        status,
        head,
        body: String::new(),
    };
    let len: usize = response.header("content-length").unwrap().parse().unwrap();

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < len {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed inside the response body");
        body.extend_from_slice(&chunk[..n]);
    }
    response.body = String::from_utf8(body).unwrap();
    response
}

/// Read until EOF; a missing close_notify counts as EOF.
async fn read_all<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
}

/// One-shot request over a fresh connection.
pub async fn get(addr: SocketAddr, opts: &ClientOptions<'_>, path: &str) -> HttpResponse {
    let mut stream = connect(addr, opts).await.unwrap();
    request(&mut stream, "GET", path, &[]).await
}

/// Trusts whatever the server presents; used when the server is self-signed.
#[derive(Debug)]
pub struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        provider().signature_verification_algorithms.supported_schemes()
    }
}

/// A TLS 1.1 ClientHello with no extensions.
pub fn tls11_client_hello() -> Vec<u8> {
    let mut body = vec![0x03, 0x02]; // client_version TLS 1.1
    body.extend_from_slice(&[0x42; 32]); // random
    body.push(0x00); // session id
    body.extend_from_slice(&[0x00, 0x04, 0xc0, 0x13, 0x00, 0x2f]); // cipher suites
    body.extend_from_slice(&[0x01, 0x00]); // null compression

    let mut handshake = vec![0x01];
    let len = u32::try_from(body.len()).unwrap().to_be_bytes();
    handshake.extend_from_slice(&len[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&u16::try_from(handshake.len()).unwrap().to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Write raw bytes and collect whatever the server answers before closing.
pub async fn raw_exchange(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(bytes).await.unwrap();
    tokio::time::timeout(TIMEOUT, read_all(&mut tcp)).await.unwrap()
}
