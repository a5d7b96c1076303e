//! Mutually-authenticated HTTPS front end for a [`Keyserver`](crate::keyserver::Keyserver)

mod router;
mod server;
pub mod tls;

pub use router::{
    FAILED_MESSAGE, FORBIDDEN_MESSAGE, PUB_PREFIX, RequestKind, STATIC_PREFIX, create_router,
    error_response,
};
pub use server::{ListenerHandle, ListenerState, start};
pub use tls::{ClientCertificate, TlsConnectionInfo};
