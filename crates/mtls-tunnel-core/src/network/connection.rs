//! Per-connection handler.
//!
//! Drives one accepted socket through
//! `Accepted → Handshaking → Authorized → Forwarding → Closed` and reports
//! every step as a [`TunnelEvent`]. Errors never leave the handler; they
//! become the connection's [`CloseReason`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::context::{ConnectionState, ProxiedConnection};
use super::forward::{forward, ForwardSettings};
use super::stream::TunnelStream;
use super::ProxySettings;
use crate::auth::PeerIdentity;
use crate::config::TunnelMode;
use crate::error::{ProxyError, Result};
use crate::events::{CloseReason, SharedEventSink, TunnelEvent};
use crate::tls::{unauthorized_peer, TlsConfiguration, TlsConnector};

/// Handles a single tunnelled connection.
pub struct ConnectionHandler {
    settings: Arc<ProxySettings>,
    tls: Arc<TlsConfiguration>,
    events: SharedEventSink,
    connection: ProxiedConnection,
    cancel: CancellationToken,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Create a handler for an accepted connection.
    ///
    /// `tls` is the configuration snapshot captured at accept time; the
    /// connection keeps it even if certificates are reloaded meanwhile.
    #[must_use]
    pub fn new(
        settings: Arc<ProxySettings>,
        tls: Arc<TlsConfiguration>,
        events: SharedEventSink,
        connection: ProxiedConnection,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            tls,
            events,
            connection,
            cancel,
            state: ConnectionState::Accepted,
        }
    }

    /// The connection's current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection to completion.
    #[instrument(skip_all, fields(conn_id = self.connection.id(), peer = %self.connection.peer()))]
    pub async fn handle(mut self, socket: TcpStream) -> CloseReason {
        self.events.emit(&TunnelEvent::ConnectionOpened {
            id: self.connection.id(),
            peer: self.connection.peer(),
        });

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            result = self.run(socket) => result,
            () = cancel.cancelled() => Err(ProxyError::Shutdown),
        };

        let reason = match result {
            Ok(reason) => reason,
            Err(e) => self.close_reason_for(&e),
        };
        self.transition(ConnectionState::Closed(reason));

        self.events.emit(&TunnelEvent::ConnectionClosed {
            id: self.connection.id(),
            peer: self.connection.peer(),
            duration: self.connection.elapsed(),
            bytes_in: self.connection.bytes_in(),
            bytes_out: self.connection.bytes_out(),
            reason,
        });
        reason
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {next}",
            self.state
        );
        debug!(from = %self.state, to = %next, "connection state");
        self.state = next;
    }

    async fn run(&mut self, socket: TcpStream) -> Result<CloseReason> {
        self.transition(ConnectionState::Handshaking);

        let (accepted, target) = match self.settings.mode {
            TunnelMode::Server => {
                let tls = self.accept_tls(socket).await?;
                self.authorized(&tls);
                let target = self.dial().await?;
                (tls, TunnelStream::Plain(target))
            }
            TunnelMode::Client => {
                let target = self.dial().await?;
                let tls = self.connect_tls(target).await?;
                self.authorized(&tls);
                (TunnelStream::Plain(socket), tls)
            }
        };

        self.transition(ConnectionState::Forwarding);
        forward(
            accepted,
            target,
            self.connection.counters().clone(),
            ForwardSettings {
                idle_timeout: self.settings.idle_timeout,
                close_grace: self.settings.close_grace,
            },
            self.cancel.clone(),
        )
        .await
    }

    async fn accept_tls(&self, socket: TcpStream) -> Result<TunnelStream> {
        let acceptor = self.tls.acceptor();
        let stream = self.handshake(acceptor.accept(socket)).await?;
        Ok(TunnelStream::ServerTls(Box::new(stream)))
    }

    async fn connect_tls(&self, target: TcpStream) -> Result<TunnelStream> {
        let server_name = TlsConnector::server_name(self.settings.target_server_name())?;
        let connector = self.tls.connector();
        let stream = self.handshake(connector.connect(server_name, target)).await?;
        Ok(TunnelStream::ClientTls(Box::new(stream)))
    }

    async fn handshake<T>(&self, handshake: impl Future<Output = std::io::Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.settings.handshake_timeout, handshake).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => match unauthorized_peer(&e) {
                Some(rejected) => Err(ProxyError::Unauthorized(rejected)),
                None => Err(ProxyError::Handshake(e.to_string())),
            },
            Err(_) => Err(ProxyError::Timeout {
                stage: "handshake",
                timeout: self.settings.handshake_timeout,
            }),
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let target = &self.settings.target_address;
        let timeout: Duration = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!(target = %target, "connected to target");
                Ok(stream)
            }
            Ok(Err(source)) => Err(ProxyError::Dial {
                target: target.clone(),
                source,
            }),
            Err(_) => Err(ProxyError::Timeout {
                stage: "connect",
                timeout,
            }),
        }
    }

    fn authorized(&mut self, tls: &TunnelStream) {
        self.events.emit(&TunnelEvent::HandshakeSucceeded {
            id: self.connection.id(),
            protocol: tls.protocol().unwrap_or_default(),
            cipher_suite: tls.cipher_suite().unwrap_or_default(),
        });

        let identity = tls
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|leaf| PeerIdentity::from_certificate(leaf).ok())
            .map_or_else(|| "anonymous".to_string(), |id| id.subject);

        self.transition(ConnectionState::Authorized);
        self.events.emit(&TunnelEvent::AuthorizationSucceeded {
            id: self.connection.id(),
            identity,
        });
    }

    fn close_reason_for(&self, err: &ProxyError) -> CloseReason {
        let id = self.connection.id();
        match err {
            ProxyError::Unauthorized(rejected) => {
                self.events.emit(&TunnelEvent::AuthorizationFailed {
                    id,
                    identity: rejected.subject.clone(),
                });
                CloseReason::Unauthorized
            }
            ProxyError::Timeout {
                stage: "handshake", ..
            } => {
                self.events.emit(&TunnelEvent::HandshakeFailed {
                    id,
                    error: err.to_string(),
                });
                CloseReason::HandshakeTimeout
            }
            ProxyError::Handshake(_) | ProxyError::Tls(_) => {
                self.events.emit(&TunnelEvent::HandshakeFailed {
                    id,
                    error: err.to_string(),
                });
                CloseReason::HandshakeFailed
            }
            ProxyError::Timeout { .. } | ProxyError::Dial { .. } => {
                debug!(error = %err, "dial failed");
                CloseReason::DialFailed
            }
            ProxyError::ForwardingIo(_) | ProxyError::Connection(_) => {
                debug!(error = %err, "forwarding failed");
                CloseReason::ForwardingError
            }
            ProxyError::Shutdown => CloseReason::Shutdown,
        }
    }
}
