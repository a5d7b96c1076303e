//! Listener lifecycle
//!
//! [`start`] provisions the keyserver, binds the socket and spawns the accept
//! loop. The returned [`ListenerHandle`] carries the shutdown trigger and the
//! channel on which exactly one terminal [`Error`] is delivered.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::router::create_router;
use super::tls;
use crate::bootstrap::generate_server_key;
use crate::keyserver::{Keyserver, KeyserverFactory};
use crate::{Error, Result};

/// Where a started listener is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Accepting connections.
    Serving,
    /// Shutdown requested; in-flight connections are draining.
    ShuttingDown,
    /// Drained after a requested shutdown.
    Stopped,
    /// The accept loop hit a fatal error.
    Failed,
}

impl ListenerState {
    /// No further transitions happen from here.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Serving => "serving",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        })
    }
}

/// Control handle for a running listener.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    errors: Option<oneshot::Receiver<Error>>,
    state: watch::Receiver<ListenerState>,
}

impl ListenerHandle {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Stop accepting and let open connections finish.
    ///
    /// Returns immediately. Repeated calls have no further effect; the
    /// terminal [`Error::Shutdown`] arrives once draining completes.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(addr = %self.local_addr, "Shutdown requested");
        }
        self.shutdown.cancel();
    }

    /// Take the raw terminal-error channel.
    ///
    /// After this, [`terminated`](Self::terminated) no longer reports anything.
    pub fn take_error_channel(&mut self) -> Option<oneshot::Receiver<Error>> {
        self.errors.take()
    }

    /// Wait for the terminal error. Cancel-safe.
    pub async fn terminated(&mut self) -> Error {
        let Some(rx) = self.errors.as_mut() else {
            return Error::Internal("Terminal error already delivered".to_string());
        };
        let err = rx
            .await
            .unwrap_or_else(|_| Error::Internal("Listener exited without reporting".to_string()));
        self.errors = None;
        err
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Provision the keyserver and start serving on `addr`.
///
/// Generates bootstrap key material when the factory asks for it, builds the
/// keyserver, binds the socket, and spawns the accept loop.
///
/// # Errors
///
/// Key generation, keyserver construction and bind failures are returned
/// here. Nothing is left running on error.
pub async fn start<F>(addr: &str, factory: F) -> Result<ListenerHandle>
where
    F: KeyserverFactory,
{
    let bootstrap_key = match factory.bootstrap_key_bits() {
        Some(bits) => {
            info!(bits, "Generating bootstrap server key");
            let key = tokio::task::spawn_blocking(move || generate_server_key(bits))
                .await
                .map_err(|e| Error::Internal(format!("Key generation task failed: {e}")))??;
            Some(key)
        }
        None => None,
    };

    let keyserver: Arc<dyn Keyserver> = Arc::new(factory.build(bootstrap_key)?);

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(addr, error = %e, "Failed to bind listener");
        Error::Io(e)
    })?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(ListenerState::Serving);
    let (error_tx, error_rx) = oneshot::channel();

    info!("============================================================");
    info!("KEYSERVER GATEWAY v{}", env!("CARGO_PKG_VERSION"));
    info!(addr = %local_addr, "Listening (TLS 1.2+, client certificates optional)");
    info!("============================================================");

    tokio::spawn(accept_loop(
        listener,
        keyserver,
        shutdown.clone(),
        state_tx,
        error_tx,
    ));

    Ok(ListenerHandle {
        local_addr,
        shutdown,
        errors: Some(error_rx),
        state: state_rx,
    })
}

/// First pause after a failed accept; doubles up to [`ACCEPT_BACKOFF_MAX`].
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// How long a connection accepted before shutdown may take to finish its
/// handshake and send a request once shutdown has started.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-connection accept failures that leave the socket usable.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// Accept failures that mean the listening socket itself is broken.
///
/// Resource exhaustion (EMFILE, ENFILE, ENOBUFS, ENOMEM) is not among them:
/// it clears once other connections close.
fn is_listener_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

/// Exponential pause between failed accepts, reset by a successful one.
#[derive(Debug, Default)]
struct AcceptBackoff {
    last: Option<Duration>,
}

impl AcceptBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .last
            .map_or(ACCEPT_BACKOFF_MIN, |last| (last * 2).min(ACCEPT_BACKOFF_MAX));
        self.last = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Sleeps for `delay` unless shutdown arrives first. Returns `false` on shutdown.
async fn pause(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

async fn accept_loop(
    listener: TcpListener,
    keyserver: Arc<dyn Keyserver>,
    shutdown: CancellationToken,
    state: watch::Sender<ListenerState>,
    errors: oneshot::Sender<Error>,
) {
    let router = create_router(Arc::clone(&keyserver));
    let connections = TaskTracker::new();
    let mut backoff = AcceptBackoff::default();

    let outcome = loop {
        let accepted = tokio::select! {
            biased;
            () = shutdown.cancelled() => break Error::Shutdown,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                backoff.reset();
                connections.spawn(serve_connection(
                    Arc::clone(&keyserver),
                    router.clone(),
                    stream,
                    peer_addr,
                    shutdown.clone(),
                ));
            }
            Err(e) if is_connection_error(&e) => {
                debug!(error = %e, "Accept failed for one connection");
            }
            Err(e) if is_listener_error(&e) => {
                error!(error = %e, "Accept loop failed");
                break Error::Io(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!(error = %e, retry_in = ?delay, "Accept failed; retrying");
                if !pause(&shutdown, delay).await {
                    break Error::Shutdown;
                }
            }
        }
    };

    drop(listener);

    let terminal_state = if outcome.is_shutdown() {
        let _ = state.send(ListenerState::ShuttingDown);
        ListenerState::Stopped
    } else {
        shutdown.cancel();
        ListenerState::Failed
    };

    connections.close();
    info!(open = connections.len(), "Draining connections");
    connections.wait().await;

    let _ = state.send(terminal_state);
    info!(state = %terminal_state, "Listener stopped");

    if errors.send(outcome).is_err() {
        debug!("Terminal error dropped; handle already gone");
    }
}

async fn serve_connection(
    keyserver: Arc<dyn Keyserver>,
    router: Router,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let handshake = tls::accept(&keyserver, stream, peer_addr);
    tokio::pin!(handshake);
    let finished = tokio::select! {
        handshake = &mut handshake => Some(handshake),
        () = shutdown.cancelled() => None,
    };
    let handshake = match finished {
        Some(handshake) => handshake,
        None => match tokio::time::timeout(SHUTDOWN_GRACE, &mut handshake).await {
            Ok(handshake) => handshake,
            Err(_) => {
                debug!(peer = %peer_addr, "Handshake unfinished at shutdown; closing");
                return;
            }
        },
    };
    let (tls_stream, info) = match handshake {
        Ok(established) => established,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    debug!(
        peer = %peer_addr,
        version = ?info.protocol_version,
        client_cert = info.client_certificate.is_some(),
        verified = info.verified_client().is_some(),
        "TLS established"
    );

    let service = TowerToHyperService::new(router.layer(Extension(info)));
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    // A connection that finished its handshake after shutdown started gets the
    // grace period to send its request before it is told to close.
    let late = shutdown.is_cancelled();
    let drain = async {
        shutdown.cancelled().await;
        if late {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    };
    tokio::pin!(drain);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer_addr, error = %e, "Connection closed with error");
                }
                break;
            }
            () = &mut drain, if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
