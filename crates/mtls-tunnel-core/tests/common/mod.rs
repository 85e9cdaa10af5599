//! Helpers shared by the TLS integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mtls_tunnel_core::auth::AllowedIdentityPattern;
use mtls_tunnel_core::store::StoreSnapshot;
use mtls_tunnel_core::testing::{TestIdentity, TestPki};
use mtls_tunnel_core::tls::{TlsConfiguration, TlsConnector, TlsServerAcceptor};
use mtls_tunnel_core::{IdentityVerifier, MinTlsVersion, TlsConfigBuilder, TlsPolicy, TrustBundle};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ProtocolVersion, RootCertStore, SupportedProtocolVersion};
use tokio::io::{duplex, AsyncReadExt};
use tokio::time::timeout;

/// Snapshot presenting `identity` and trusting the roots of `trusted`.
pub fn snapshot(identity: &TestIdentity, trusted: &[&TestPki]) -> StoreSnapshot {
    StoreSnapshot {
        identity: Arc::new(identity.identity()),
        trust: Arc::new(TrustBundle::new(
            trusted.iter().map(|pki| pki.root_der()).collect(),
        )),
        version: 1,
    }
}

pub fn policy(
    min_version: MinTlsVersion,
    require_client_auth: bool,
    patterns: Vec<AllowedIdentityPattern>,
) -> TlsPolicy {
    TlsPolicy {
        min_version,
        require_client_auth,
        verifier: IdentityVerifier::new(patterns),
    }
}

pub fn build(snapshot: &StoreSnapshot, policy: TlsPolicy) -> TlsConfiguration {
    TlsConfigBuilder::new(policy).build(snapshot).unwrap()
}

/// A plain rustls client outside the tunnel's policy, e.g. pinned to TLS 1.2.
pub fn raw_client(
    trusted: &TestPki,
    identity: Option<&TestIdentity>,
    versions: &[&'static SupportedProtocolVersion],
) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(trusted.root_der()).unwrap();
    let builder =
        ClientConfig::builder_with_protocol_versions(versions).with_root_certificates(roots);
    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(
                vec![identity.cert_der.clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key_der.clone())),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    TlsConnector::new(Arc::new(config))
}

/// Outcome of one in-memory handshake.
pub struct Handshake {
    pub server: io::Result<Option<ProtocolVersion>>,
    pub client: io::Result<Option<ProtocolVersion>>,
}

/// Run a handshake between `acceptor` and `connector` over an in-memory pipe.
pub async fn handshake(
    acceptor: TlsServerAcceptor,
    connector: TlsConnector,
    server_name: &str,
) -> Handshake {
    let (client_io, server_io) = duplex(64 * 1024);
    let name: ServerName<'static> = TlsConnector::server_name(server_name).unwrap();

    let (server, client) = tokio::join!(acceptor.accept(server_io), async {
        let mut stream = match connector.connect(name, client_io).await {
            Ok(stream) => stream,
            Err(e) => return Err(e),
        };
        let version = stream.get_ref().1.protocol_version();
        // TLS 1.3 clients finish before the server has checked their
        // certificate; a short read surfaces the server's verdict.
        let mut buf = [0u8; 1];
        match timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
            Ok(Err(e)) => Err(e),
            _ => Ok(version),
        }
    });

    // The server stream lives until here so the client read does not see EOF.
    let server = server.map(|stream| stream.get_ref().1.protocol_version());
    Handshake { server, client }
}
