//! Configuration management

use std::{collections::BTreeMap, path::Path, path::PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::bootstrap::AUTHORITY_BITS;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Authority material used for TLS
    pub authority: AuthorityConfig,
    /// Public keys served under `/pub/<name>`, by name
    pub published: BTreeMap<String, PathBuf>,
    /// Directory served under `/static/`
    pub static_dir: Option<PathBuf>,
    /// Node admission
    pub admission: AdmissionConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on (`host:port`)
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:20557".to_string(),
        }
    }
}

/// TLS identity and trust configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// PEM bundle of CAs trusted to authenticate clients
    pub client_ca: Option<PathBuf>,
    /// Durable server certificate chain (PEM)
    pub server_cert: Option<PathBuf>,
    /// Durable server private key (PEM)
    pub server_key: Option<PathBuf>,
    /// Strength of authority keys; also used for the temporary server key
    pub key_bits: usize,
    /// Host names placed in the temporary server certificate
    pub hostnames: Vec<String>,
    /// Validity of the temporary server certificate, in days
    pub temporary_validity_days: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            client_ca: None,
            server_cert: None,
            server_key: None,
            key_bits: AUTHORITY_BITS,
            hostnames: vec!["localhost".to_string()],
            temporary_validity_days: 7,
        }
    }
}

impl AuthorityConfig {
    /// Durable cert/key pair, when both halves are configured.
    #[must_use]
    pub fn durable_identity(&self) -> Option<(&Path, &Path)> {
        match (&self.server_cert, &self.server_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Node admission configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Bearer tokens accepted on `/admit`
    pub tokens: Vec<String>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // KEYGATEWAY_SERVER__LISTEN=... style overrides
        figment = figment.merge(Env::prefixed("KEYGATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot produce a working listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let a = &self.authority;
        if a.server_cert.is_some() != a.server_key.is_some() {
            return Err(Error::Config(
                "authority.server_cert and authority.server_key must be set together".to_string(),
            ));
        }
        if a.durable_identity().is_none() {
            if a.key_bits < 2048 {
                return Err(Error::Config(format!(
                    "authority.key_bits must be at least 2048, got {}",
                    a.key_bits
                )));
            }
            if a.hostnames.is_empty() {
                return Err(Error::Config(
                    "authority.hostnames is required for the temporary certificate".to_string(),
                ));
            }
        }
        Ok(())
    }
}
