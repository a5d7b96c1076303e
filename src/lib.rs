//! Keyserver Gateway Library
//!
//! Mutually-authenticated HTTPS front end for a cluster keyserver.
//!
//! # Features
//!
//! - **Per-handshake TLS**: server certificate and trusted client CAs are
//!   fetched from the keyserver on every handshake, so rotation needs no restart
//! - **Optional client auth**: certificates are requested, verified, and the
//!   outcome attached to each request; untrusted peers still connect
//! - **Four routes**: `/apirequest`, `/pub/<name>`, `/static/<path>`, `/admit`
//! - **Error classification**: denials never leak their reason; API and
//!   admission failures point to the server logs
//! - **Bootstrap keys**: ephemeral RSA key for a temporary server identity
//! - **Graceful shutdown**: in-flight connections drain, one terminal error
//!   is reported

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keyserver;
pub mod mtls;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns [`Error::Config`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
