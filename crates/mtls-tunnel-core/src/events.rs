//! Structured events emitted by the tunnel core.
//!
//! The core never formats log lines for connection lifecycle or reloads
//! itself. It emits [`TunnelEvent`]s to an [`EventSink`]; the CLI plugs in
//! [`TracingEventSink`] and the Prometheus sink, tests plug in a recorder.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

/// Why a connection reached the `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Both directions finished normally.
    Completed,
    /// The TLS handshake did not finish in time.
    HandshakeTimeout,
    /// The TLS handshake failed (chain verification, protocol, I/O).
    HandshakeFailed,
    /// The peer's chain verified but its identity is not allowed.
    Unauthorized,
    /// The target could not be reached.
    DialFailed,
    /// No bytes moved within the idle timeout.
    IdleTimeout,
    /// An I/O error while copying bytes.
    ForwardingError,
    /// The tunnel is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::HandshakeFailed => "handshake_failed",
            Self::Unauthorized => "unauthorized",
            Self::DialFailed => "dial_failed",
            Self::IdleTimeout => "idle_timeout",
            Self::ForwardingError => "forwarding_error",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle and reload events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    ConnectionOpened {
        id: u64,
        peer: SocketAddr,
    },
    /// Over the connection limit; the socket was dropped.
    ConnectionRejected {
        peer: SocketAddr,
        active: usize,
        limit: usize,
    },
    HandshakeSucceeded {
        id: u64,
        protocol: String,
        cipher_suite: String,
    },
    HandshakeFailed {
        id: u64,
        error: String,
    },
    AuthorizationSucceeded {
        id: u64,
        identity: String,
    },
    AuthorizationFailed {
        id: u64,
        identity: String,
    },
    ConnectionClosed {
        id: u64,
        peer: SocketAddr,
        duration: Duration,
        /// Bytes copied from the accepted side to the target.
        bytes_in: u64,
        /// Bytes copied from the target to the accepted side.
        bytes_out: u64,
        reason: CloseReason,
    },
    ReloadSucceeded {
        version: u64,
        changed: bool,
    },
    ReloadFailed {
        error: String,
    },
}

/// Receiver of [`TunnelEvent`]s.
///
/// Called inline from connection tasks, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TunnelEvent);
}

/// Shared handle to a sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &TunnelEvent) {}
}

/// Renders events as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &TunnelEvent) {
        match event {
            TunnelEvent::ConnectionOpened { id, peer } => {
                info!(conn_id = id, peer = %peer, "connection opened");
            }
            TunnelEvent::ConnectionRejected {
                peer,
                active,
                limit,
            } => {
                warn!(peer = %peer, active, limit, "connection limit reached, rejecting");
            }
            TunnelEvent::HandshakeSucceeded {
                id,
                protocol,
                cipher_suite,
            } => {
                info!(conn_id = id, protocol, cipher_suite, "TLS handshake complete");
            }
            TunnelEvent::HandshakeFailed { id, error } => {
                warn!(conn_id = id, error, "TLS handshake failed");
            }
            TunnelEvent::AuthorizationSucceeded { id, identity } => {
                info!(conn_id = id, identity, "peer authorized");
            }
            TunnelEvent::AuthorizationFailed { id, identity } => {
                warn!(conn_id = id, identity, "peer not authorized");
            }
            TunnelEvent::ConnectionClosed {
                id,
                peer,
                duration,
                bytes_in,
                bytes_out,
                reason,
            } => {
                info!(
                    conn_id = id,
                    peer = %peer,
                    duration_ms = duration.as_millis() as u64,
                    bytes_in,
                    bytes_out,
                    reason = %reason,
                    "connection closed"
                );
            }
            TunnelEvent::ReloadSucceeded { version, changed } => {
                info!(version, changed, "certificate reload succeeded");
            }
            TunnelEvent::ReloadFailed { error } => {
                warn!(error, "certificate reload failed, keeping current certificates");
            }
        }
    }
}

/// Fans events out to several sinks in order.
#[derive(Clone, Default)]
pub struct CompositeEventSink {
    sinks: Vec<SharedEventSink>,
}

impl CompositeEventSink {
    pub fn new(sinks: Vec<SharedEventSink>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: SharedEventSink) {
        self.sinks.push(sink);
    }
}

impl EventSink for CompositeEventSink {
    fn emit(&self, event: &TunnelEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl EventSink for Counting {
        fn emit(&self, _event: &TunnelEvent) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let composite = CompositeEventSink::new(vec![a.clone(), b.clone()]);

        composite.emit(&TunnelEvent::ReloadSucceeded {
            version: 2,
            changed: true,
        });

        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_close_reason_labels() {
        assert_eq!(CloseReason::HandshakeTimeout.to_string(), "handshake_timeout");
        assert_eq!(CloseReason::Unauthorized.as_str(), "unauthorized");
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let sink = TracingEventSink;
        sink.emit(&TunnelEvent::ConnectionOpened { id: 1, peer });
        sink.emit(&TunnelEvent::ConnectionClosed {
            id: 1,
            peer,
            duration: Duration::from_millis(5),
            bytes_in: 1,
            bytes_out: 2,
            reason: CloseReason::Completed,
        });
        sink.emit(&TunnelEvent::ReloadFailed {
            error: "boom".to_string(),
        });
    }
}
