//! End-to-end tests for `client` mode: plain text in, TLS out.

mod common;

use std::time::Duration;

use common::{build, policy, snapshot};
use mtls_tunnel_core::auth::{AllowedIdentityPattern, IdentityAttribute};
use mtls_tunnel_core::events::CloseReason;
use mtls_tunnel_core::keystore::{IdentitySource, KeystoreSources};
use mtls_tunnel_core::testing::{
    test_settings, CaptureBackend, LeafSpec, TestIdentity, TestPki, TunnelHarness,
};
use mtls_tunnel_core::{MinTlsVersion, TunnelEvent, TunnelMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

/// TLS target presenting `target` and requiring client certificates from `trusted`.
async fn tls_target(target: &TestIdentity, trusted: &TestPki) -> CaptureBackend {
    let config = build(
        &snapshot(target, &[trusted]),
        policy(MinTlsVersion::Tls12, true, vec![]),
    );
    CaptureBackend::start_tls(true, config.acceptor())
        .await
        .unwrap()
}

fn client_sources(pki: &TestPki, identity: &TestIdentity) -> KeystoreSources {
    KeystoreSources {
        identity: IdentitySource::CertAndKey {
            cert_path: pki.write("tunnel.crt", &identity.cert_pem),
            key_path: pki.write("tunnel.key", &identity.key_pem),
        },
        trust_bundle: Some(pki.write_root("ca.pem")),
        require_trust: false,
    }
}

async fn start_tunnel(
    pki: &TestPki,
    target: &CaptureBackend,
    patterns: Vec<AllowedIdentityPattern>,
) -> TunnelHarness {
    let identity = pki.issue(&LeafSpec::new("tunnel.example.com"));
    TunnelHarness::start(
        test_settings(TunnelMode::Client, target.addr()),
        client_sources(pki, &identity),
        policy(MinTlsVersion::Tls12, false, patterns),
    )
    .await
}

/// Send `payload` and read until the tunnel closes the plain-text side.
async fn exchange(tunnel: &TunnelHarness, payload: &[u8]) -> Vec<u8> {
    let mut tcp = TcpStream::connect(tunnel.addr()).await.unwrap();
    let _ = tcp.write_all(payload).await;
    let _ = tcp.shutdown().await;
    let mut received = Vec::new();
    let _ = tokio::time::timeout(WAIT, tcp.read_to_end(&mut received)).await;
    received
}

fn closed_with(reason: CloseReason) -> impl Fn(&TunnelEvent) -> bool {
    move |e| matches!(e, TunnelEvent::ConnectionClosed { reason: r, .. } if *r == reason)
}

#[tokio::test]
async fn test_plaintext_client_reaches_tls_target() {
    let pki = TestPki::new("Client Mode Root");
    let target_identity = pki.issue(&LeafSpec::new("localhost"));
    let target = tls_target(&target_identity, &pki).await;
    let tunnel = start_tunnel(&pki, &target, vec![]).await;

    let echoed = exchange(&tunnel, b"ping over mtls").await;
    assert_eq!(echoed, b"ping over mtls");

    let captured = target.next_closed(WAIT).await.expect("target saw the connection");
    assert_eq!(captured.received, b"ping over mtls");

    let closed = tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::Completed))
        .await
        .expect("connection closed");
    if let TunnelEvent::ConnectionClosed {
        bytes_in, bytes_out, ..
    } = closed
    {
        assert_eq!(bytes_in, 14);
        assert_eq!(bytes_out, 14);
    }
    assert!(tunnel.events.events().iter().any(|e| matches!(
        e,
        TunnelEvent::AuthorizationSucceeded { identity, .. } if identity.contains("localhost")
    )));
}

#[tokio::test]
async fn test_target_signed_by_other_root_is_rejected() {
    let pki = TestPki::new("Client Mode Root");
    let rogue = TestPki::new("Rogue Root");
    let target_identity = rogue.issue(&LeafSpec::new("localhost"));
    let target = tls_target(&target_identity, &pki).await;
    let tunnel = start_tunnel(&pki, &target, vec![]).await;

    let received = exchange(&tunnel, b"secret").await;
    assert!(received.is_empty());

    assert!(tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::HandshakeFailed))
        .await
        .is_some());
    assert!(target.next_closed(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_target_with_mismatched_name_is_rejected() {
    let pki = TestPki::new("Client Mode Root");
    let target_identity = pki.issue(&LeafSpec::new("wrong.example.com"));
    let target = tls_target(&target_identity, &pki).await;
    let tunnel = start_tunnel(&pki, &target, vec![]).await;

    let received = exchange(&tunnel, b"secret").await;
    assert!(received.is_empty());

    let failed = tunnel
        .events
        .wait_for(WAIT, |e| matches!(e, TunnelEvent::HandshakeFailed { .. }))
        .await
        .expect("handshake failure reported");
    if let TunnelEvent::HandshakeFailed { error, .. } = failed {
        assert!(!error.is_empty());
    }
    assert!(tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::HandshakeFailed))
        .await
        .is_some());
}

#[tokio::test]
async fn test_target_outside_allow_list_is_unauthorized() {
    let pki = TestPki::new("Client Mode Root");
    let target_identity = pki.issue(&LeafSpec::new("localhost").ou("staging"));
    let target = tls_target(&target_identity, &pki).await;
    let tunnel = start_tunnel(
        &pki,
        &target,
        vec![AllowedIdentityPattern::exact(
            IdentityAttribute::OrganizationalUnit,
            "production",
        )],
    )
    .await;

    let received = exchange(&tunnel, b"secret").await;
    assert!(received.is_empty());

    assert!(tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::Unauthorized))
        .await
        .is_some());
    assert!(tunnel
        .events
        .events()
        .iter()
        .any(|e| matches!(e, TunnelEvent::AuthorizationFailed { .. })));
}

#[tokio::test]
async fn test_unreachable_target_reports_dial_failure() {
    let pki = TestPki::new("Client Mode Root");
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let identity = pki.issue(&LeafSpec::new("tunnel.example.com"));
    let tunnel = TunnelHarness::start(
        test_settings(TunnelMode::Client, dead_addr),
        client_sources(&pki, &identity),
        policy(MinTlsVersion::Tls12, false, vec![]),
    )
    .await;

    let received = exchange(&tunnel, b"anyone there").await;
    assert!(received.is_empty());
    assert!(tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::DialFailed))
        .await
        .is_some());
}
