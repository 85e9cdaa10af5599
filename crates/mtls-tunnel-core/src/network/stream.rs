//! Stream abstraction over the legs of a tunnelled connection.
//!
//! Each leg is either plain TCP or TLS. In `server` mode the accepted leg is
//! a TLS server stream and the target leg plain; in `client` mode the
//! accepted leg is plain and the target leg a TLS client stream.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use rustls::pki_types::CertificateDer;
use rustls::CommonState;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A plain or TLS-wrapped TCP stream.
pub enum TunnelStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS where the tunnel is the server.
    ServerTls(Box<server::TlsStream<TcpStream>>),
    /// TLS where the tunnel is the client.
    ClientTls(Box<client::TlsStream<TcpStream>>),
}

impl TunnelStream {
    /// Check if this leg is encrypted.
    pub fn is_tls(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    /// Peer address of the underlying TCP connection.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Plain(stream) => stream.peer_addr(),
            Self::ServerTls(stream) => stream.get_ref().0.peer_addr(),
            Self::ClientTls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    fn tls_state(&self) -> Option<&CommonState> {
        match self {
            Self::Plain(_) => None,
            Self::ServerTls(stream) => {
                let state: &CommonState = stream.get_ref().1;
                Some(state)
            }
            Self::ClientTls(stream) => {
                let state: &CommonState = stream.get_ref().1;
                Some(state)
            }
        }
    }

    /// The peer's certificate chain, leaf first.
    ///
    /// `None` for plain legs and for TLS clients that sent no certificate.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.tls_state()?.peer_certificates()
    }

    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub fn protocol(&self) -> Option<String> {
        self.tls_state()?
            .protocol_version()
            .map(|v| format!("{v:?}"))
    }

    /// Negotiated cipher suite.
    pub fn cipher_suite(&self) -> Option<String> {
        self.tls_state()?
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            TunnelStream::ServerTls(stream) => Pin::new(stream).poll_read(cx, buf),
            TunnelStream::ClientTls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            TunnelStream::ServerTls(stream) => Pin::new(stream).poll_write(cx, buf),
            TunnelStream::ClientTls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            TunnelStream::ServerTls(stream) => Pin::new(stream).poll_flush(cx),
            TunnelStream::ClientTls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            TunnelStream::ServerTls(stream) => Pin::new(stream).poll_shutdown(cx),
            TunnelStream::ClientTls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
