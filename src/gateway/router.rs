//! HTTP router and error classification

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::any,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::warn;

use crate::keyserver::{Keyserver, OperationError};

/// Prefix stripped before public key lookups.
pub const PUB_PREFIX: &str = "/pub/";
/// Prefix stripped before static content lookups.
pub const STATIC_PREFIX: &str = "/static/";

/// Body sent for every authorisation denial.
pub const FORBIDDEN_MESSAGE: &str = "Particular operation forbidden.";
/// Body sent for failed API and admission requests.
pub const FAILED_MESSAGE: &str = "Request processing failed. See server logs for details.";

/// The four request categories the gateway dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `/apirequest`
    Api,
    /// `/pub/<name>`
    PublicKey,
    /// `/static/<path>`
    Static,
    /// `/admit`
    Admit,
}

impl RequestKind {
    /// Label used in logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Api => "API",
            Self::PublicKey => "Public key",
            Self::Static => "Static",
            Self::Admit => "Admit",
        }
    }

    /// Lookups may echo the failure text back; API and admission never do.
    #[must_use]
    pub fn discloses_errors(self) -> bool {
        matches!(self, Self::PublicKey | Self::Static)
    }
}

/// Create the router
pub fn create_router(keyserver: Arc<dyn Keyserver>) -> Router {
    Router::new()
        .route("/apirequest", any(api_handler))
        .route("/pub/", any(pub_handler))
        .route("/pub/{*name}", any(pub_handler))
        .route("/static/", any(static_handler))
        .route("/static/{*path}", any(static_handler))
        .route("/admit", any(admit_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(keyserver)
}

/// Map a handler failure to the client-facing response.
///
/// The status depends on the error variant and request kind only. Every
/// failure is logged in full regardless of what the client is told.
#[must_use]
pub fn error_response(kind: RequestKind, err: &OperationError) -> Response {
    warn!(request = kind.label(), error = %err, "{} request failed", kind.label());

    let (status, body) = match err {
        OperationError::Forbidden(_) => (StatusCode::FORBIDDEN, FORBIDDEN_MESSAGE.to_string()),
        OperationError::Failed(_) if kind.discloses_errors() => (
            StatusCode::NOT_FOUND,
            format!("Request processing failed: {err}"),
        ),
        OperationError::Failed(_) => (StatusCode::BAD_REQUEST, FAILED_MESSAGE.to_string()),
    };

    plain_error(status, body)
}

fn plain_error(status: StatusCode, mut body: String) -> Response {
    body.push('\n');
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body,
    )
        .into_response()
}

/// Raw path remainder after `prefix`; no decoding or normalisation.
fn remainder<'a>(uri: &'a Uri, prefix: &str) -> &'a str {
    uri.path().strip_prefix(prefix).unwrap_or_default()
}

fn finish(kind: RequestKind, result: Result<Response, OperationError>) -> Response {
    result.unwrap_or_else(|e| error_response(kind, &e))
}

/// `/apirequest`; the whole request goes to the keyserver.
async fn api_handler(State(ks): State<Arc<dyn Keyserver>>, request: Request) -> Response {
    finish(RequestKind::Api, ks.handle_api_request(request).await)
}

/// `/pub/<name>`
async fn pub_handler(State(ks): State<Arc<dyn Keyserver>>, uri: Uri) -> Response {
    let name = remainder(&uri, PUB_PREFIX);
    finish(RequestKind::PublicKey, ks.handle_pub_request(name).await)
}

/// `/static/<path>`
async fn static_handler(State(ks): State<Arc<dyn Keyserver>>, uri: Uri) -> Response {
    let path = remainder(&uri, STATIC_PREFIX);
    finish(RequestKind::Static, ks.handle_static_request(path).await)
}

/// `/admit`; the whole request goes to the keyserver.
async fn admit_handler(State(ks): State<Arc<dyn Keyserver>>, request: Request) -> Response {
    finish(RequestKind::Admit, ks.handle_admit_request(request).await)
}
