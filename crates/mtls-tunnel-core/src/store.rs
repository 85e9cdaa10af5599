//! Versioned, hot-reloadable holder of the tunnel's key material.
//!
//! Readers call [`CertificateStore::current`], which is a single atomic
//! pointer load and never waits for a reload. [`CertificateStore::reload`]
//! reads and validates everything first and only then swaps the snapshot,
//! so a failed reload is invisible to readers.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::KeystoreResult;
use crate::events::{SharedEventSink, TunnelEvent};
use crate::keystore::{Identity, KeystoreSources, TrustBundle};

/// One consistent view of identity and trust.
#[derive(Debug)]
pub struct StoreSnapshot {
    pub identity: Arc<Identity>,
    pub trust: Arc<TrustBundle>,
    /// Starts at 1; bumped by every reload that changes key material.
    pub version: u64,
}

impl StoreSnapshot {
    fn same_material(&self, identity: &Identity, trust: &TrustBundle) -> bool {
        self.identity.same_material(identity) && *self.trust == *trust
    }
}

/// Result of a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub version: u64,
    /// False when the files held the same material as the active snapshot.
    pub changed: bool,
}

/// Atomic holder of the active [`StoreSnapshot`].
pub struct CertificateStore {
    sources: KeystoreSources,
    current: ArcSwap<StoreSnapshot>,
    reload_lock: Mutex<()>,
    events: SharedEventSink,
}

impl CertificateStore {
    /// Load identity and trust once and create the store at version 1.
    ///
    /// # Errors
    ///
    /// Any loader error; no store is created.
    pub async fn initialize(
        sources: KeystoreSources,
        events: SharedEventSink,
    ) -> KeystoreResult<Self> {
        let (identity, trust) = sources.load().await?;
        info!(
            chain_len = identity.certificate_chain().len(),
            trust_anchors = trust.certificates().len(),
            system_roots = trust.includes_system_roots(),
            "certificate store initialized"
        );

        Ok(Self {
            sources,
            current: ArcSwap::from_pointee(StoreSnapshot {
                identity,
                trust,
                version: 1,
            }),
            reload_lock: Mutex::new(()),
            events,
        })
    }

    /// The active snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<StoreSnapshot> {
        self.current.load_full()
    }

    /// Version of the active snapshot.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Re-read the sources and swap in new material if it changed.
    ///
    /// Concurrent calls are serialized. Unchanged material keeps the
    /// version.
    ///
    /// # Errors
    ///
    /// Any loader error. The active snapshot is left untouched.
    pub async fn reload(&self) -> KeystoreResult<ReloadOutcome> {
        let _guard = self.reload_lock.lock().await;

        let (identity, trust) = match self.sources.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.events.emit(&TunnelEvent::ReloadFailed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let active = self.current.load_full();
        let outcome = if active.same_material(&identity, &trust) {
            debug!(version = active.version, "key material unchanged");
            ReloadOutcome {
                version: active.version,
                changed: false,
            }
        } else {
            let version = active.version + 1;
            self.current.store(Arc::new(StoreSnapshot {
                identity,
                trust,
                version,
            }));
            ReloadOutcome {
                version,
                changed: true,
            }
        };

        self.events.emit(&TunnelEvent::ReloadSucceeded {
            version: outcome.version,
            changed: outcome.changed,
        });
        Ok(outcome)
    }
}

/// Reload `store` every `interval` until `shutdown` fires.
///
/// Failures are reported through the store's event sink and the loop keeps
/// going.
pub fn spawn_timed_reload(
    store: Arc<CertificateStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors were already emitted as ReloadFailed.
                    let _ = store.reload().await;
                }
                () = shutdown.cancelled() => {
                    debug!("timed reload stopped");
                    break;
                }
            }
        }
    })
}
