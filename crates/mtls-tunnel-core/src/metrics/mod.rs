//! Metrics collection for the tunnel.
//!
//! Provides Prometheus-compatible metrics for connection, handshake,
//! authorization and reload activity.

pub mod prometheus;

pub use prometheus::TunnelMetrics;
