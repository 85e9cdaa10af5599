//! TCP listener for the accepting side of the tunnel.
//!
//! The listener accepts connections and spawns a task for each one,
//! delegating to [`ConnectionHandler`]. On shutdown it stops accepting,
//! waits up to the drain period for in-flight connections and then
//! force-closes the rest.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::connection::ConnectionHandler;
use super::context::ProxiedConnection;
use super::ProxySettings;
use crate::error::Result;
use crate::events::{SharedEventSink, TunnelEvent};
use crate::tls::TlsConfigCache;

/// Decrements the active connection count when the task ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// TCP listener that accepts tunnel connections.
pub struct TunnelListener {
    listener: TcpListener,
    settings: Arc<ProxySettings>,
    tls: Arc<TlsConfigCache>,
    events: SharedEventSink,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    active_connections: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl TunnelListener {
    /// Bind the listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the listen address fails.
    pub async fn bind(
        settings: ProxySettings,
        tls: Arc<TlsConfigCache>,
        events: SharedEventSink,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&settings.listen_address).await?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Ok(Self {
            listener,
            settings: Arc::new(settings),
            tls,
            events,
            shutdown_tx,
            shutdown_rx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        })
    }

    /// The bound address; useful when listening on port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get a shutdown handle to signal the listener to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Shared counter of in-flight connections.
    #[must_use]
    pub fn active_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_connections)
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Run the accept loop until shutdown, then drain.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and the
    /// loop continues.
    #[instrument(skip(self), fields(address = %self.settings.listen_address, mode = %self.settings.mode))]
    pub async fn run(mut self) -> Result<()> {
        info!(target = %self.settings.target_address, "tunnel listening");

        let tracker = TaskTracker::new();
        let force_close = CancellationToken::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => self.spawn_connection(socket, addr, &tracker, &force_close),
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        drop(self.listener);
        tracker.close();

        let active = self.active_connections.load(Ordering::Relaxed);
        if active > 0 {
            info!(active, drain = ?self.settings.shutdown_drain, "waiting for connections to close");
        }
        if tokio::time::timeout(self.settings.shutdown_drain, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.active_connections.load(Ordering::Relaxed),
                "drain period elapsed, closing remaining connections"
            );
            force_close.cancel();
            tracker.wait().await;
        }

        info!("listener stopped");
        Ok(())
    }

    fn spawn_connection(
        &self,
        socket: tokio::net::TcpStream,
        addr: SocketAddr,
        tracker: &TaskTracker,
        force_close: &CancellationToken,
    ) {
        let current = self.active_connections.load(Ordering::Relaxed);

        // Check connection limit
        if current >= self.settings.max_connections {
            debug!(peer = %addr, active = current, "connection rejected: limit reached");
            self.events.emit(&TunnelEvent::ConnectionRejected {
                peer: addr,
                active: current,
                limit: self.settings.max_connections,
            });
            // Socket will be dropped, closing the connection
            return;
        }

        self.active_connections.fetch_add(1, Ordering::Relaxed);
        let guard = ActiveGuard(Arc::clone(&self.active_connections));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %addr, conn_id = id, active = current + 1, "accepted connection");

        let _ = socket.set_nodelay(true);
        let handler = ConnectionHandler::new(
            Arc::clone(&self.settings),
            self.tls.current(),
            Arc::clone(&self.events),
            ProxiedConnection::new(id, addr),
            force_close.child_token(),
        );

        tracker.spawn(async move {
            let _guard = guard;
            let reason = handler.handle(socket).await;
            debug!(peer = %addr, conn_id = id, %reason, "connection finished");
        });
    }
}
