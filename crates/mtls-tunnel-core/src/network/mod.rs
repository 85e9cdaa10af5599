//! Network layer of the tunnel.
//!
//! This module provides:
//! - TCP listener with connection limit and graceful drain
//! - Per-connection handler driving handshake, authorization and dialing
//! - Bidirectional forwarding with half-close and idle timeout

use std::time::Duration;

use crate::config::TunnelMode;

pub mod connection;
pub mod context;
pub mod forward;
pub mod listener;
pub mod stream;

pub use connection::ConnectionHandler;
pub use context::{ConnectionState, ProxiedConnection, TrafficCounters};
pub use forward::{forward, ForwardSettings};
pub use listener::TunnelListener;
pub use stream::TunnelStream;

/// Settings shared by the listener and every connection.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub mode: TunnelMode,
    pub listen_address: String,
    pub target_address: String,
    /// SNI and certificate name for the target in client mode.
    pub target_server_name: String,
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    pub close_grace: Duration,
    pub shutdown_drain: Duration,
}

impl ProxySettings {
    /// Server name used for the client-mode handshake.
    #[must_use]
    pub fn target_server_name(&self) -> &str {
        &self.target_server_name
    }
}
