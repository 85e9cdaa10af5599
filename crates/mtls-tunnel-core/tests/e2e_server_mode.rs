//! End-to-end tests for `server` mode: TLS in, plain text out.

mod common;

use std::time::Duration;

use common::raw_client;
use mtls_tunnel_core::auth::{AllowedIdentityPattern, IdentityAttribute};
use mtls_tunnel_core::events::CloseReason;
use mtls_tunnel_core::keystore::{IdentitySource, KeystoreSources, Password};
use mtls_tunnel_core::testing::{
    test_settings, CaptureBackend, LeafSpec, TestIdentity, TestPki, TunnelHarness,
};
use mtls_tunnel_core::tls::TlsConnector;
use mtls_tunnel_core::{IdentityVerifier, MinTlsVersion, TlsPolicy, TunnelEvent, TunnelMode};
use rustls::version::{TLS12, TLS13};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

struct Setup {
    pki: TestPki,
    client: TestIdentity,
    backend: CaptureBackend,
    tunnel: TunnelHarness,
}

fn server_sources(pki: &TestPki, identity: &TestIdentity) -> KeystoreSources {
    KeystoreSources {
        identity: IdentitySource::Keystore {
            path: pki.write("tunnel.p12", identity.pkcs12("tunnel-pass")),
            password: Password::new("tunnel-pass"),
        },
        trust_bundle: Some(pki.write_root("ca.pem")),
        require_trust: true,
    }
}

fn allow_cn(cn: &str) -> TlsPolicy {
    TlsPolicy {
        min_version: MinTlsVersion::Tls12,
        require_client_auth: true,
        verifier: IdentityVerifier::new(vec![AllowedIdentityPattern::exact(
            IdentityAttribute::CommonName,
            cn,
        )]),
    }
}

async fn setup(echo: bool, tweak: impl FnOnce(&mut mtls_tunnel_core::ProxySettings)) -> Setup {
    let pki = TestPki::new("E2E Root");
    let server = pki.issue(&LeafSpec::new("localhost"));
    let client = pki.issue(&LeafSpec::new("client.example.com"));
    let backend = CaptureBackend::start(echo).await.unwrap();

    let mut settings = test_settings(TunnelMode::Server, backend.addr());
    tweak(&mut settings);
    let tunnel = TunnelHarness::start(
        settings,
        server_sources(&pki, &server),
        allow_cn("client.example.com"),
    )
    .await;

    Setup {
        pki,
        client,
        backend,
        tunnel,
    }
}

async fn connect_tls(
    connector: &TlsConnector,
    setup: &Setup,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(setup.tunnel.addr()).await?;
    connector
        .connect(TlsConnector::server_name("localhost").unwrap(), tcp)
        .await
}

fn closed_with(reason: CloseReason) -> impl Fn(&TunnelEvent) -> bool {
    move |e| matches!(e, TunnelEvent::ConnectionClosed { reason: r, .. } if *r == reason)
}

// =============================================================================
// Forwarding
// =============================================================================

#[tokio::test]
async fn test_tls12_client_bytes_arrive_verbatim() {
    let setup = setup(false, |_| {}).await;
    let connector = raw_client(&setup.pki, Some(&setup.client), &[&TLS12]);

    let mut stream = connect_tls(&connector, &setup).await.unwrap();
    assert_eq!(
        stream.get_ref().1.protocol_version(),
        Some(rustls::ProtocolVersion::TLSv1_2)
    );

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    stream.write_all(&payload).await.unwrap();
    stream.shutdown().await.unwrap();

    // Closing the client closes the backend connection within the grace period.
    let captured = setup.backend.next_closed(WAIT).await.expect("backend closed");
    assert_eq!(captured.received, payload);

    let closed = setup
        .tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::Completed))
        .await
        .expect("connection closed");
    if let TunnelEvent::ConnectionClosed { bytes_in, .. } = closed {
        assert_eq!(bytes_in, payload.len() as u64);
    }

    let events = setup.tunnel.events.events();
    assert!(events.iter().any(|e| matches!(
        e,
        TunnelEvent::AuthorizationSucceeded { identity, .. } if identity.contains("client.example.com")
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        TunnelEvent::HandshakeSucceeded { protocol, .. } if protocol == "TLSv1_2"
    )));
}

#[tokio::test]
async fn test_echo_roundtrip() {
    let setup = setup(true, |_| {}).await;
    let connector = raw_client(&setup.pki, Some(&setup.client), &[&TLS13]);

    let mut stream = connect_tls(&connector, &setup).await.unwrap();
    stream.write_all(b"hello through the tunnel").await.unwrap();

    let mut buf = [0u8; 24];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
    assert!(rest.is_empty());

    let closed = setup
        .tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::Completed))
        .await
        .expect("connection closed");
    if let TunnelEvent::ConnectionClosed {
        bytes_in, bytes_out, ..
    } = closed
    {
        assert_eq!(bytes_in, 24);
        assert_eq!(bytes_out, 24);
    }
}

// =============================================================================
// Rejections
// =============================================================================

#[tokio::test]
async fn test_unauthorized_client_never_reaches_backend() {
    let setup = setup(false, |_| {}).await;
    let other = setup.pki.issue(&LeafSpec::new("other.example.com"));
    let connector = raw_client(&setup.pki, Some(&other), &[&TLS13]);

    if let Ok(mut stream) = connect_tls(&connector, &setup).await {
        // TLS 1.3 reports the refusal on the first read.
        let mut buf = [0u8; 1];
        assert!(!matches!(stream.read(&mut buf).await, Ok(n) if n > 0));
    }

    let failed = setup
        .tunnel
        .events
        .wait_for(WAIT, |e| matches!(e, TunnelEvent::AuthorizationFailed { .. }))
        .await
        .expect("authorization failure reported");
    if let TunnelEvent::AuthorizationFailed { identity, .. } = failed {
        assert!(identity.contains("other.example.com"));
    }
    assert!(setup
        .tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::Unauthorized))
        .await
        .is_some());
    assert_eq!(setup.backend.accepted(), 0);
}

#[tokio::test]
async fn test_allow_list_rejects_client_without_certificate() {
    let pki = TestPki::new("E2E Root");
    let server = pki.issue(&LeafSpec::new("localhost"));
    let backend = CaptureBackend::start(false).await.unwrap();
    // Optional client certificates, but an allow-list still applies.
    let policy = TlsPolicy {
        require_client_auth: false,
        ..allow_cn("client.example.com")
    };
    let tunnel = TunnelHarness::start(
        test_settings(TunnelMode::Server, backend.addr()),
        server_sources(&pki, &server),
        policy,
    )
    .await;
    assert!(tunnel.tls.current().require_client_auth);

    let connector = raw_client(&pki, None, &[&TLS13]);
    let tcp = TcpStream::connect(tunnel.addr()).await.unwrap();
    if let Ok(mut stream) = connector
        .connect(TlsConnector::server_name("localhost").unwrap(), tcp)
        .await
    {
        let _ = stream.write_all(b"anonymous-data").await;
        let mut buf = [0u8; 1];
        assert!(!matches!(stream.read(&mut buf).await, Ok(n) if n > 0));
    }

    assert!(tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::HandshakeFailed))
        .await
        .is_some());
    assert!(!tunnel
        .events
        .events()
        .iter()
        .any(|e| matches!(e, TunnelEvent::AuthorizationSucceeded { .. })));
    assert_eq!(backend.accepted(), 0);
}

#[tokio::test]
async fn test_plaintext_client_fails_handshake() {
    let setup = setup(false, |_| {}).await;

    let mut tcp = TcpStream::connect(setup.tunnel.addr()).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let _ = tcp.read_to_end(&mut buf).await;

    assert!(setup
        .tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::HandshakeFailed))
        .await
        .is_some());
    assert!(setup
        .tunnel
        .events
        .events()
        .iter()
        .any(|e| matches!(e, TunnelEvent::HandshakeFailed { .. })));
}

#[tokio::test]
async fn test_silent_client_hits_handshake_timeout() {
    let setup = setup(false, |s| s.handshake_timeout = Duration::from_millis(200)).await;

    let _tcp = TcpStream::connect(setup.tunnel.addr()).await.unwrap();
    assert!(setup
        .tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::HandshakeTimeout))
        .await
        .is_some());
}

#[tokio::test]
async fn test_connection_limit() {
    let setup = setup(false, |s| s.max_connections = 1).await;
    let connector = raw_client(&setup.pki, Some(&setup.client), &[&TLS13]);

    let mut first = connect_tls(&connector, &setup).await.unwrap();
    first.write_all(b"x").await.unwrap();
    first.flush().await.unwrap();
    setup
        .tunnel
        .events
        .wait_for(WAIT, |e| matches!(e, TunnelEvent::AuthorizationSucceeded { .. }))
        .await
        .expect("first connection authorized");

    // Over the limit: the socket is dropped before any handshake.
    let mut second = TcpStream::connect(setup.tunnel.addr()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, second.read(&mut buf)).await.unwrap();
    assert!(!matches!(read, Ok(n) if n > 0));

    let rejected = setup
        .tunnel
        .events
        .wait_for(WAIT, |e| matches!(e, TunnelEvent::ConnectionRejected { .. }))
        .await
        .expect("rejection reported");
    assert!(matches!(
        rejected,
        TunnelEvent::ConnectionRejected {
            active: 1,
            limit: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unreachable_target_reports_dial_failure() {
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let pki = TestPki::new("E2E Root");
    let server = pki.issue(&LeafSpec::new("localhost"));
    let client = pki.issue(&LeafSpec::new("client.example.com"));
    let tunnel = TunnelHarness::start(
        test_settings(TunnelMode::Server, dead_addr),
        server_sources(&pki, &server),
        allow_cn("client.example.com"),
    )
    .await;

    let connector = raw_client(&pki, Some(&client), &[&TLS13]);
    let tcp = TcpStream::connect(tunnel.addr()).await.unwrap();
    if let Ok(mut stream) = connector
        .connect(TlsConnector::server_name("localhost").unwrap(), tcp)
        .await
    {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
    }

    assert!(tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::DialFailed))
        .await
        .is_some());
}

// =============================================================================
// Idle timeout, reload and shutdown
// =============================================================================

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let setup = setup(false, |s| s.idle_timeout = Some(Duration::from_millis(200))).await;
    let connector = raw_client(&setup.pki, Some(&setup.client), &[&TLS13]);

    let mut stream = connect_tls(&connector, &setup).await.unwrap();
    stream.write_all(b"once").await.unwrap();

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(WAIT, stream.read_to_end(&mut buf)).await;

    assert!(setup
        .tunnel
        .events
        .wait_for(WAIT, closed_with(CloseReason::IdleTimeout))
        .await
        .is_some());
}

#[tokio::test]
async fn test_reload_serves_new_certificate_to_new_connections() {
    let setup = setup(true, |_| {}).await;
    let connector = raw_client(&setup.pki, Some(&setup.client), &[&TLS13]);

    let mut before = connect_tls(&connector, &setup).await.unwrap();
    before.write_all(b"a").await.unwrap();
    let mut buf = [0u8; 1];
    before.read_exact(&mut buf).await.unwrap();
    let old_leaf = before.get_ref().1.peer_certificates().unwrap()[0].clone();

    let rotated = setup.pki.issue(&LeafSpec::new("localhost"));
    setup.pki.write("tunnel.p12", rotated.pkcs12("tunnel-pass"));
    let outcome = setup.tunnel.store.reload().await.unwrap();
    assert!(outcome.changed);

    // The established connection keeps working on its old configuration.
    before.write_all(b"b").await.unwrap();
    before.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"b");

    let after = connect_tls(&connector, &setup).await.unwrap();
    let new_leaf = after.get_ref().1.peer_certificates().unwrap()[0].clone();
    assert_ne!(old_leaf, new_leaf);
    assert_eq!(new_leaf, rotated.cert_der);
    assert_eq!(setup.tunnel.tls.current().version, 2);
}

#[tokio::test]
async fn test_shutdown_force_closes_after_drain() {
    let setup = setup(false, |s| s.shutdown_drain = Duration::from_millis(200)).await;
    let connector = raw_client(&setup.pki, Some(&setup.client), &[&TLS13]);

    let mut stream = connect_tls(&connector, &setup).await.unwrap();
    stream.write_all(b"hold").await.unwrap();
    setup
        .tunnel
        .events
        .wait_for(WAIT, |e| matches!(e, TunnelEvent::AuthorizationSucceeded { .. }))
        .await
        .expect("connection authorized");

    let events = setup.tunnel.events.clone();
    tokio::time::timeout(WAIT, setup.tunnel.shutdown())
        .await
        .expect("shutdown completes");

    assert_eq!(events.matching(closed_with(CloseReason::Shutdown)).len(), 1);

    // The client sees its connection end.
    let mut buf = Vec::new();
    let read = tokio::time::timeout(WAIT, stream.read_to_end(&mut buf)).await;
    assert!(read.is_ok());
}
