//! File-backed keyserver.
//!
//! Serves what the configuration points at: public keys by name, a static
//! directory, the client CA bundle for admitted nodes, and the caller's own
//! certificate identity on `/apirequest`. Certificate issuance and the policy
//! engine are not part of this implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json,
    extract::Request,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use parking_lot::RwLock;
use rustls::RootCertStore;
use rustls::sign::CertifiedKey;
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::{HandshakeInfo, Keyserver, KeyserverFactory, OperationError};
use crate::bootstrap::BootstrapKey;
use crate::config::{AuthorityConfig, Config};
use crate::gateway::TlsConnectionInfo;
use crate::mtls::{CertGenerator, certified_key, load_certs, load_private_key, parse_certs, root_store_from};
use crate::{Error, Result};

/// Builds a [`ConfiguredKeyserver`] from a loaded [`Config`].
#[derive(Debug, Clone)]
pub struct ConfiguredKeyserverFactory {
    config: Config,
}

impl ConfiguredKeyserverFactory {
    /// Wrap a loaded configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl KeyserverFactory for ConfiguredKeyserverFactory {
    type Keyserver = ConfiguredKeyserver;

    fn bootstrap_key_bits(&self) -> Option<usize> {
        let authority = &self.config.authority;
        authority
            .durable_identity()
            .is_none()
            .then_some(authority.key_bits)
    }

    fn build(self, bootstrap_key: Option<BootstrapKey>) -> Result<ConfiguredKeyserver> {
        ConfiguredKeyserver::new(self.config, bootstrap_key.as_ref())
    }
}

/// Keyserver backed by files named in the configuration.
pub struct ConfiguredKeyserver {
    server_key: RwLock<Arc<CertifiedKey>>,
    client_cas: Arc<RootCertStore>,
    client_ca_pem: String,
    published: BTreeMap<String, PathBuf>,
    static_dir: Option<PathBuf>,
    admission_tokens: Vec<String>,
}

impl ConfiguredKeyserver {
    /// Load trust material and the server identity.
    ///
    /// Uses the durable certificate when configured, otherwise self-signs a
    /// temporary certificate over `bootstrap_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured file is unreadable, or if there is
    /// neither a durable identity nor a bootstrap key.
    pub fn new(config: Config, bootstrap_key: Option<&BootstrapKey>) -> Result<Self> {
        let (client_cas, client_ca_pem) = match &config.authority.client_ca {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Cannot read client CA '{}': {e}", path.display()))
                })?;
                (root_store_from(parse_certs(pem.as_bytes())?)?, pem)
            }
            None => {
                warn!("No client CA configured; every client certificate will be unverified");
                (RootCertStore::empty(), String::new())
            }
        };

        let server_key = server_identity(&config.authority, bootstrap_key)?;

        info!(
            trusted_cas = client_cas.len(),
            published = config.published.len(),
            static_dir = ?config.static_dir,
            "Keyserver loaded"
        );

        Ok(Self {
            server_key: RwLock::new(server_key),
            client_cas: Arc::new(client_cas),
            client_ca_pem,
            published: config.published,
            static_dir: config.static_dir,
            admission_tokens: config.admission.tokens,
        })
    }

    /// Swap in a new server identity; the next handshake presents it.
    pub fn replace_server_certificate(&self, key: Arc<CertifiedKey>) {
        *self.server_key.write() = key;
        info!("Server certificate replaced");
    }
}

fn server_identity(
    authority: &AuthorityConfig,
    bootstrap_key: Option<&BootstrapKey>,
) -> Result<Arc<CertifiedKey>> {
    if let Some((cert, key)) = authority.durable_identity() {
        return certified_key(load_certs(cert)?, load_private_key(key)?);
    }

    let key = bootstrap_key.ok_or_else(|| {
        Error::Config("No server certificate configured and no bootstrap key supplied".to_string())
    })?;
    let generated = CertGenerator::self_signed_server(
        &key.to_pkcs8_pem()?,
        &authority.hostnames,
        authority.temporary_validity_days,
    )?;
    info!(
        hostnames = ?authority.hostnames,
        bits = key.bits(),
        "Serving temporary self-signed certificate"
    );
    generated.to_certified_key()
}

/// A static path must be relative with no empty, `.` or `..` segments.
fn validate_static_path(path: &str) -> std::result::Result<&Path, OperationError> {
    if path.is_empty() {
        return Err(OperationError::failed("empty static path"));
    }
    let clean = path
        .split('/')
        .all(|segment| !matches!(segment, "" | "." | ".."));
    if !clean {
        return Err(OperationError::failed(format!("invalid static path: {path}")));
    }
    Ok(Path::new(path))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

async fn read_payload(path: &Path, what: &str) -> std::result::Result<Vec<u8>, OperationError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| OperationError::failed(format!("cannot read {what}: {e}")))
}

#[async_trait]
impl Keyserver for ConfiguredKeyserver {
    fn server_certificate(&self, _handshake: &HandshakeInfo) -> Result<Arc<CertifiedKey>> {
        Ok(Arc::clone(&self.server_key.read()))
    }

    fn trusted_client_authorities(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.client_cas)
    }

    async fn handle_api_request(&self, request: Request) -> std::result::Result<Response, OperationError> {
        let client = request
            .extensions()
            .get::<TlsConnectionInfo>()
            .and_then(TlsConnectionInfo::verified_client)
            .ok_or_else(|| {
                OperationError::forbidden("request not authenticated by a trusted client certificate")
            })?;
        let identity = client
            .identity
            .as_ref()
            .ok_or_else(|| OperationError::failed("client certificate subject unreadable"))?;

        Ok(Json(json!({
            "principal": identity.display_name,
            "identity": identity,
        }))
        .into_response())
    }

    async fn handle_pub_request(&self, name: &str) -> std::result::Result<Response, OperationError> {
        let path = self
            .published
            .get(name)
            .ok_or_else(|| OperationError::failed(format!("no such public key: {name}")))?;
        let body = read_payload(path, &format!("public key {name}")).await?;
        Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
    }

    async fn handle_static_request(&self, path: &str) -> std::result::Result<Response, OperationError> {
        let relative = validate_static_path(path)?;
        let root = self
            .static_dir
            .as_ref()
            .ok_or_else(|| OperationError::failed("static content not configured"))?;
        let body = read_payload(&root.join(relative), &format!("static file {path}")).await?;
        Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
    }

    async fn handle_admit_request(&self, request: Request) -> std::result::Result<Response, OperationError> {
        if self.admission_tokens.is_empty() {
            return Err(OperationError::forbidden("admission disabled"));
        }
        let presented = bearer_token(request.headers())
            .ok_or_else(|| OperationError::forbidden("missing admission token"))?;

        let admitted = self
            .admission_tokens
            .iter()
            .any(|t| bool::from(t.as_bytes().ct_eq(presented.as_bytes())));
        if !admitted {
            return Err(OperationError::forbidden("admission token not recognised"));
        }

        let peer = request
            .extensions()
            .get::<TlsConnectionInfo>()
            .map(|info| info.peer_addr);
        info!(peer = ?peer, "Node admitted");

        Ok(Json(json!({ "client_ca": self.client_ca_pem })).into_response())
    }
}
