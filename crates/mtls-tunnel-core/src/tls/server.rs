//! TLS server acceptor for inbound connections in `server` mode.
//!
//! The tunnel presents its own certificate and verifies client
//! certificates with [`super::AuthorizingClientVerifier`].

use std::io;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;
use tracing::debug;

/// TLS acceptor bound to one configuration snapshot.
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: TokioTlsAcceptor,
}

impl TlsServerAcceptor {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: TokioTlsAcceptor::from(config),
        }
    }

    /// Run the server handshake on `stream`.
    ///
    /// The raw I/O error is returned so the caller can classify it with
    /// [`super::unauthorized_peer`].
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    pub async fn accept<S>(&self, stream: S) -> io::Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!("accepting TLS connection from client");
        self.inner.accept(stream).await
    }
}
