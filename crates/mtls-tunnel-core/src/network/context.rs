//! Per-connection bookkeeping.
//!
//! A [`ProxiedConnection`] is created when the listener accepts a socket and
//! is shared by the connection task and its two forwarding pumps, which
//! update the byte counters.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::CloseReason;

/// Lifecycle of a tunnelled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Authorized,
    Forwarding,
    Closed(CloseReason),
}

impl ConnectionState {
    /// Whether `next` may follow `self`.
    ///
    /// The happy path is strictly ordered; any non-terminal state may close.
    #[must_use]
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, Handshaking)
                | (Handshaking, Authorized)
                | (Authorized, Forwarding)
                | (Accepted | Handshaking | Authorized | Forwarding, Closed(_))
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::Handshaking => f.write_str("handshaking"),
            Self::Authorized => f.write_str("authorized"),
            Self::Forwarding => f.write_str("forwarding"),
            Self::Closed(reason) => write!(f, "closed({reason})"),
        }
    }
}

/// Byte counters shared with the pump tasks.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    /// Accepted side to target.
    pub bytes_in: AtomicU64,
    /// Target to accepted side.
    pub bytes_out: AtomicU64,
}

/// One accepted connection.
#[derive(Debug, Clone)]
pub struct ProxiedConnection {
    id: u64,
    peer: SocketAddr,
    established_at: Instant,
    counters: Arc<TrafficCounters>,
}

impl ProxiedConnection {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            established_at: Instant::now(),
            counters: Arc::new(TrafficCounters::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time since the socket was accepted.
    pub fn elapsed(&self) -> Duration {
        self.established_at.elapsed()
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    pub fn bytes_in(&self) -> u64 {
        self.counters.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.counters.bytes_out.load(Ordering::Relaxed)
    }
}
