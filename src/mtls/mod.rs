//! Certificate material for the mutually-authenticated listener.
//!
//! - [`identity`]: X.509 field extraction for presented client certificates
//! - [`cert_manager`]: PEM loading, rustls key material, `rcgen` generation

pub mod cert_manager;
pub mod identity;

pub use cert_manager::{
    CaParams, CertGenerator, GeneratedCert, LeafCertParams, certified_key, load_certs,
    load_private_key, parse_certs, root_store_from,
};
pub use identity::CertIdentity;
