//! Prometheus metrics for the tunnel.
//!
//! [`TunnelMetrics`] is an [`EventSink`]: every counter is driven by the
//! event stream, so the core never calls into metrics directly.

use prometheus::core::Collector;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::events::{EventSink, TunnelEvent};

/// Tunnel metrics collection.
pub struct TunnelMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Accepted connections.
    pub connections_total: IntCounter,

    /// Connections dropped at the connection limit.
    pub connections_rejected: IntCounter,

    /// Connections currently open.
    pub active_connections: IntGauge,

    /// Closed connections by close reason.
    pub connections_closed: IntCounterVec,

    /// Connection lifetime by close reason.
    pub connection_duration_seconds: HistogramVec,

    /// Handshakes by result.
    pub handshakes_total: IntCounterVec,

    /// Authorization decisions by result.
    pub authorizations_total: IntCounterVec,

    /// Bytes forwarded, `in` toward the target and `out` back.
    pub bytes_total: IntCounterVec,

    /// Reload attempts by result.
    pub reloads_total: IntCounterVec,

    /// Version of the active certificate snapshot.
    pub certificate_version: IntGauge,
}

fn register<T: Collector + Clone + 'static>(registry: &Registry, metric: T) -> T {
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration should succeed");
    metric
}

impl TunnelMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "mtls_tunnel_connections_total",
            "Total number of accepted connections",
        )
        .expect("metric creation should succeed");

        let connections_rejected = IntCounter::new(
            "mtls_tunnel_connections_rejected_total",
            "Connections dropped because the connection limit was reached",
        )
        .expect("metric creation should succeed");

        let active_connections = IntGauge::new(
            "mtls_tunnel_active_connections",
            "Current number of open connections",
        )
        .expect("metric creation should succeed");

        let connections_closed = IntCounterVec::new(
            Opts::new(
                "mtls_tunnel_connections_closed_total",
                "Closed connections by close reason",
            ),
            &["reason"],
        )
        .expect("metric creation should succeed");

        let connection_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mtls_tunnel_connection_duration_seconds",
                "Connection lifetime in seconds",
            )
            .buckets(vec![
                0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0, 3600.0,
            ]),
            &["reason"],
        )
        .expect("metric creation should succeed");

        let handshakes_total = IntCounterVec::new(
            Opts::new("mtls_tunnel_handshakes_total", "TLS handshakes by result"),
            &["result"],
        )
        .expect("metric creation should succeed");

        let authorizations_total = IntCounterVec::new(
            Opts::new(
                "mtls_tunnel_authorizations_total",
                "Peer authorization decisions by result",
            ),
            &["result"],
        )
        .expect("metric creation should succeed");

        let bytes_total = IntCounterVec::new(
            Opts::new("mtls_tunnel_bytes_total", "Bytes forwarded by direction"),
            &["direction"],
        )
        .expect("metric creation should succeed");

        let reloads_total = IntCounterVec::new(
            Opts::new(
                "mtls_tunnel_reloads_total",
                "Certificate reload attempts by result",
            ),
            &["result"],
        )
        .expect("metric creation should succeed");

        let certificate_version = IntGauge::new(
            "mtls_tunnel_certificate_version",
            "Version of the active certificate snapshot",
        )
        .expect("metric creation should succeed");

        Self {
            connections_total: register(&registry, connections_total),
            connections_rejected: register(&registry, connections_rejected),
            active_connections: register(&registry, active_connections),
            connections_closed: register(&registry, connections_closed),
            connection_duration_seconds: register(&registry, connection_duration_seconds),
            handshakes_total: register(&registry, handshakes_total),
            authorizations_total: register(&registry, authorizations_total),
            bytes_total: register(&registry, bytes_total),
            reloads_total: register(&registry, reloads_total),
            certificate_version: register(&registry, certificate_version),
            registry,
        }
    }

    /// Set the active certificate version, e.g. after startup.
    pub fn set_certificate_version(&self, version: u64) {
        self.certificate_version
            .set(i64::try_from(version).unwrap_or(i64::MAX));
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for TunnelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for TunnelMetrics {
    fn emit(&self, event: &TunnelEvent) {
        match event {
            TunnelEvent::ConnectionOpened { .. } => {
                self.connections_total.inc();
                self.active_connections.inc();
            }
            TunnelEvent::ConnectionRejected { .. } => self.connections_rejected.inc(),
            TunnelEvent::HandshakeSucceeded { .. } => {
                self.handshakes_total.with_label_values(&["success"]).inc();
            }
            TunnelEvent::HandshakeFailed { .. } => {
                self.handshakes_total.with_label_values(&["failure"]).inc();
            }
            TunnelEvent::AuthorizationSucceeded { .. } => {
                self.authorizations_total
                    .with_label_values(&["allowed"])
                    .inc();
            }
            TunnelEvent::AuthorizationFailed { .. } => {
                // rustls rejects the peer inside the handshake.
                self.handshakes_total.with_label_values(&["failure"]).inc();
                self.authorizations_total
                    .with_label_values(&["denied"])
                    .inc();
            }
            TunnelEvent::ConnectionClosed {
                duration,
                bytes_in,
                bytes_out,
                reason,
                ..
            } => {
                self.active_connections.dec();
                self.connections_closed
                    .with_label_values(&[reason.as_str()])
                    .inc();
                self.connection_duration_seconds
                    .with_label_values(&[reason.as_str()])
                    .observe(duration.as_secs_f64());
                self.bytes_total.with_label_values(&["in"]).inc_by(*bytes_in);
                self.bytes_total
                    .with_label_values(&["out"])
                    .inc_by(*bytes_out);
            }
            TunnelEvent::ReloadSucceeded { version, .. } => {
                self.reloads_total.with_label_values(&["success"]).inc();
                self.set_certificate_version(*version);
            }
            TunnelEvent::ReloadFailed { .. } => {
                self.reloads_total.with_label_values(&["failure"]).inc();
            }
        }
    }
}
