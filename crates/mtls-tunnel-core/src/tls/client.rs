//! TLS client connector for outbound connections in `client` mode.

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tracing::debug;

use crate::error::{TlsError, TlsResult};

/// TLS connector bound to one configuration snapshot.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TokioTlsConnector,
}

impl TlsConnector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: TokioTlsConnector::from(config),
        }
    }

    /// Parse a host name or IP literal for SNI and certificate checks.
    ///
    /// # Errors
    ///
    /// [`TlsError::InvalidServerName`] if `name` is neither.
    pub fn server_name(name: &str) -> TlsResult<ServerName<'static>> {
        ServerName::try_from(name.to_string())
            .map_err(|_| TlsError::InvalidServerName(name.to_string()))
    }

    /// Run the client handshake on `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    pub async fn connect<S>(
        &self,
        server_name: ServerName<'static>,
        stream: S,
    ) -> io::Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(server_name = ?server_name, "initiating TLS handshake");
        self.inner.connect(server_name, stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_accepts_dns_and_ip() {
        assert!(TlsConnector::server_name("backend.example.com").is_ok());
        assert!(TlsConnector::server_name("127.0.0.1").is_ok());
    }

    #[test]
    fn test_server_name_rejects_garbage() {
        assert!(matches!(
            TlsConnector::server_name("not a host name"),
            Err(TlsError::InvalidServerName(_))
        ));
    }
}
