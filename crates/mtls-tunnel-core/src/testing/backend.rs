//! Capture backend: a TCP (optionally TLS) server that records what it
//! receives per connection and can echo it back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::tls::TlsServerAcceptor;

/// What one backend connection received before its peer closed.
#[derive(Debug, Clone)]
pub struct CapturedConnection {
    pub peer: SocketAddr,
    pub received: Vec<u8>,
}

/// Recording backend for forwarding tests.
pub struct CaptureBackend {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed_rx: Mutex<mpsc::UnboundedReceiver<CapturedConnection>>,
    handle: JoinHandle<()>,
}

impl CaptureBackend {
    /// Start a plain-text backend on an ephemeral port.
    ///
    /// With `echo`, every chunk read is written straight back.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start(echo: bool) -> std::io::Result<Self> {
        Self::start_inner(echo, None).await
    }

    /// Start a TLS backend that terminates with `acceptor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_tls(echo: bool, acceptor: TlsServerAcceptor) -> std::io::Result<Self> {
        Self::start_inner(echo, Some(acceptor)).await
    }

    async fn start_inner(echo: bool, acceptor: Option<TlsServerAcceptor>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let accepted = Arc::new(AtomicUsize::new(0));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let counter = Arc::clone(&accepted);
        let handle = tokio::spawn(async move {
            while let Ok((socket, peer)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let closed_tx = closed_tx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let received = match acceptor {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(stream) => serve(stream, echo).await,
                            Err(e) => {
                                debug!(error = %e, "backend handshake failed");
                                return;
                            }
                        },
                        None => serve(socket, echo).await,
                    };
                    let _ = closed_tx.send(CapturedConnection { peer, received });
                });
            }
        });

        Ok(Self {
            addr,
            accepted,
            closed_rx: Mutex::new(closed_rx),
            handle,
        })
    }

    /// The backend's address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of TCP connections accepted so far.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Wait for the next connection to be closed by its peer.
    pub async fn next_closed(&self, timeout: Duration) -> Option<CapturedConnection> {
        let mut rx = self.closed_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

impl Drop for CaptureBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Read until EOF, echoing if asked, then close.
async fn serve<S>(mut stream: S, echo: bool) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                received.extend_from_slice(&buf[..n]);
                if echo && stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = stream.shutdown().await;
    received
}
