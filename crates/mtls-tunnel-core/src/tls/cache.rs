//! Per-version cache of [`TlsConfiguration`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::{info, warn};

use super::builder::{TlsConfigBuilder, TlsConfiguration};
use crate::error::TlsResult;
use crate::store::CertificateStore;

/// Serves the configuration matching the store's current version.
///
/// A version change triggers one rebuild. If the rebuild fails the previous
/// configuration keeps being served and the failure is logged once per
/// store version.
pub struct TlsConfigCache {
    store: Arc<CertificateStore>,
    builder: TlsConfigBuilder,
    current: ArcSwap<TlsConfiguration>,
    failed_version: AtomicU64,
    rebuild: Mutex<()>,
}

impl TlsConfigCache {
    /// Build the configuration for the store's current snapshot.
    ///
    /// # Errors
    ///
    /// The initial build must succeed.
    pub fn new(store: Arc<CertificateStore>, builder: TlsConfigBuilder) -> TlsResult<Self> {
        let initial = builder.build(&store.current())?;
        Ok(Self {
            store,
            builder,
            current: ArcSwap::from_pointee(initial),
            failed_version: AtomicU64::new(0),
            rebuild: Mutex::new(()),
        })
    }

    /// The configuration for the current store version.
    pub fn current(&self) -> Arc<TlsConfiguration> {
        let cached = self.current.load_full();
        let snapshot = self.store.current();
        if cached.version == snapshot.version
            || self.failed_version.load(Ordering::Relaxed) == snapshot.version
        {
            return cached;
        }

        let _guard = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have rebuilt while we waited.
        let cached = self.current.load_full();
        if cached.version == snapshot.version {
            return cached;
        }

        match self.builder.build(&snapshot) {
            Ok(config) => {
                info!(version = config.version, "TLS configuration rebuilt");
                let config = Arc::new(config);
                self.current.store(config.clone());
                config
            }
            Err(e) => {
                warn!(
                    version = snapshot.version,
                    serving = cached.version,
                    error = %e,
                    "failed to rebuild TLS configuration, keeping previous"
                );
                self.failed_version.store(snapshot.version, Ordering::Relaxed);
                cached
            }
        }
    }

    /// The store this cache follows.
    #[must_use]
    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }
}
