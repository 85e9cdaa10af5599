//! Test utilities for the mutual-TLS tunnel.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`TestPki`] - A throwaway root CA issuing leaf certificates
//! - [`CaptureBackend`] - A plain or TLS backend recording what it receives
//! - [`RecordingSink`] - An event sink that keeps every event
//! - [`TunnelHarness`] - A running tunnel on an ephemeral port
//!
//! # Example
//!
//! ```rust,ignore
//! use mtls_tunnel_core::testing::{CaptureBackend, LeafSpec, TestPki, TunnelHarness, test_settings};
//!
//! #[tokio::test]
//! async fn test_forwarding() {
//!     let pki = TestPki::new("root");
//!     let server = pki.issue(&LeafSpec::new("localhost"));
//!     let backend = CaptureBackend::start(false).await.unwrap();
//!     let tunnel = TunnelHarness::start(
//!         test_settings(TunnelMode::Server, backend.addr()),
//!         sources,
//!         policy,
//!     )
//!     .await;
//! }
//! ```

pub mod backend;
pub mod events;
pub mod harness;
pub mod pki;

pub use backend::{CaptureBackend, CapturedConnection};
pub use events::RecordingSink;
pub use harness::{test_settings, TunnelHarness};
pub use pki::{LeafSpec, TestIdentity, TestPki};
