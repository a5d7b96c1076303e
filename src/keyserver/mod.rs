//! The capability set the gateway depends on.
//!
//! The gateway never decides whether an operation is allowed, never signs
//! anything and never reads the cluster configuration itself. All of that is
//! behind the [`Keyserver`] trait:
//!
//! ```text
//! handshake ──► server_certificate() / trusted_client_authorities()
//! /apirequest ──► handle_api_request()
//! /pub/<name> ──► handle_pub_request()
//! /static/<p> ──► handle_static_request()
//! /admit     ──► handle_admit_request()
//! ```
//!
//! Implementations own their internal locking. Certificate material is
//! returned as `Arc` snapshots; rotating it means returning a new `Arc`, never
//! mutating one that a handshake may still hold.

pub mod configured;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::Request, response::Response};
use rustls::RootCertStore;
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use thiserror::Error;

use crate::Result;
use crate::bootstrap::BootstrapKey;

pub use configured::{ConfiguredKeyserver, ConfiguredKeyserverFactory};

/// Failure returned by a request handler.
///
/// The router picks the HTTP status from the variant alone; the message is
/// only ever logged, or echoed back for lookup paths.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The caller is not authorised for the operation.
    #[error("operation forbidden: {0}")]
    Forbidden(String),

    /// Anything else: malformed input, missing resource, internal failure.
    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    /// Authorisation denial.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    /// Generic failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Whether this error is an authorisation denial.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}

/// Handshake parameters visible to certificate resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// SNI host name, if the client sent one.
    pub server_name: Option<String>,
    /// ALPN protocols offered by the client, in client order.
    pub alpn: Vec<Vec<u8>>,
}

impl HandshakeInfo {
    /// Capture the fields of a rustls `ClientHello`.
    #[must_use]
    pub fn from_client_hello(hello: &ClientHello<'_>) -> Self {
        Self {
            server_name: hello.server_name().map(str::to_owned),
            alpn: hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
        }
    }
}

/// Keyserver capability set.
///
/// On success a handler returns the complete response; the gateway writes it
/// unchanged.
#[async_trait]
pub trait Keyserver: Send + Sync + 'static {
    /// Server identity for one handshake.
    ///
    /// Called on every handshake, so a new certificate takes effect without
    /// restarting the listener. An error aborts only this handshake.
    fn server_certificate(&self, handshake: &HandshakeInfo) -> Result<Arc<CertifiedKey>>;

    /// CAs a presented client certificate is checked against.
    fn trusted_client_authorities(&self) -> Arc<RootCertStore>;

    /// Authenticated API operation (`/apirequest`).
    async fn handle_api_request(&self, request: Request) -> std::result::Result<Response, OperationError>;

    /// Public key lookup (`/pub/<name>`).
    async fn handle_pub_request(&self, name: &str) -> std::result::Result<Response, OperationError>;

    /// Static content (`/static/<path>`).
    async fn handle_static_request(&self, path: &str) -> std::result::Result<Response, OperationError>;

    /// Node admission (`/admit`).
    async fn handle_admit_request(&self, request: Request) -> std::result::Result<Response, OperationError>;
}

/// Builds a [`Keyserver`] at listener start.
pub trait KeyserverFactory {
    /// The keyserver this factory produces.
    type Keyserver: Keyserver;

    /// Strength of the ephemeral key the keyserver needs, or `None` when it
    /// already has durable server material.
    fn bootstrap_key_bits(&self) -> Option<usize>;

    /// Construct the keyserver.
    ///
    /// `bootstrap_key` is `Some` exactly when [`bootstrap_key_bits`] returned
    /// `Some`.
    ///
    /// [`bootstrap_key_bits`]: KeyserverFactory::bootstrap_key_bits
    fn build(self, bootstrap_key: Option<BootstrapKey>) -> Result<Self::Keyserver>;
}
