//! Test harness for end-to-end tunnel tests.
//!
//! Provides a running tunnel with:
//! - A certificate store loaded from real files
//! - A TLS configuration cache
//! - A listener on an ephemeral port
//! - A recording event sink

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::events::RecordingSink;
use crate::config::TunnelMode;
use crate::error::Result;
use crate::events::SharedEventSink;
use crate::keystore::KeystoreSources;
use crate::network::{ProxySettings, TunnelListener};
use crate::store::CertificateStore;
use crate::tls::{TlsConfigBuilder, TlsConfigCache, TlsPolicy};

/// Settings with short timeouts for tests.
#[must_use]
pub fn test_settings(mode: TunnelMode, target: SocketAddr) -> ProxySettings {
    ProxySettings {
        mode,
        listen_address: "127.0.0.1:0".to_string(),
        target_address: target.to_string(),
        target_server_name: "localhost".to_string(),
        max_connections: 100,
        handshake_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        idle_timeout: None,
        close_grace: Duration::from_millis(500),
        shutdown_drain: Duration::from_secs(1),
    }
}

/// A running tunnel.
pub struct TunnelHarness {
    addr: SocketAddr,
    pub store: Arc<CertificateStore>,
    pub tls: Arc<TlsConfigCache>,
    pub events: Arc<RecordingSink>,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<Result<()>>>,
}

impl TunnelHarness {
    /// Load key material, build the TLS configuration and start listening.
    ///
    /// # Panics
    ///
    /// Panics if the key material does not load or the listener cannot bind.
    pub async fn start(settings: ProxySettings, sources: KeystoreSources, policy: TlsPolicy) -> Self {
        let events = Arc::new(RecordingSink::new());
        let sink: SharedEventSink = events.clone();

        let store = Arc::new(
            CertificateStore::initialize(sources, sink.clone())
                .await
                .expect("Failed to load key material"),
        );
        let tls = Arc::new(
            TlsConfigCache::new(Arc::clone(&store), TlsConfigBuilder::new(policy))
                .expect("Failed to build TLS configuration"),
        );

        let listener = TunnelListener::bind(settings, Arc::clone(&tls), sink)
            .await
            .expect("Failed to bind tunnel listener");
        let addr = listener.local_addr().expect("listener has an address");
        let shutdown = listener.shutdown_handle();
        let task = tokio::spawn(listener.run());

        Self {
            addr,
            store,
            tls,
            events,
            shutdown,
            task: Some(task),
        }
    }

    /// The tunnel's listen address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and wait for the listener to drain.
    ///
    /// # Panics
    ///
    /// Panics if the listener task panicked.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await.expect("listener task panicked");
        }
    }
}

impl Drop for TunnelHarness {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
