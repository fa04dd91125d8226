//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use multiserve::config::{ListenerConfig, ServiceConfig, TlsConfig, VerifyMode};
use multiserve::net::TlsTerminator;
use multiserve::routing::Dispatcher;
use multiserve::service::AppRegistry;
use multiserve::HttpServer;

/// Listener settings for an ephemeral port on loopback.
pub fn local_listener() -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        header_timeout_secs: 2.0,
        shutdown_grace_secs: 1.0,
        ..ListenerConfig::default()
    }
}

pub fn service(name: &str, prefix: &str, app: &str) -> ServiceConfig {
    ServiceConfig::new(name, prefix, app)
}

/// Start a plain-HTTP server over `services`.
pub fn start_server(services: &[ServiceConfig], registry: &AppRegistry) -> HttpServer {
    let dispatcher = Arc::new(Dispatcher::from_config(services, registry).unwrap());
    HttpServer::bind(&local_listener(), dispatcher, None).unwrap()
}

/// Start a TLS server over `services`.
pub fn start_tls_server(services: &[ServiceConfig], registry: &AppRegistry, tls: TlsConfig) -> HttpServer {
    let dispatcher = Arc::new(Dispatcher::from_config(services, registry).unwrap());
    let mut listener = local_listener();
    listener.tls = Some(tls.clone());
    let terminator = TlsTerminator::from_config(&tls).unwrap();
    HttpServer::bind(&listener, dispatcher, Some(terminator)).unwrap()
}

pub fn url(server: &HttpServer, path: &str) -> String {
    format!("http://{}{}", server.local_addr(), path)
}

/// Write raw bytes, read until the server closes.
pub async fn raw_request(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out)).await;
    String::from_utf8_lossy(&out).into_owned()
}

/// Status code of a raw response, if there is a status line.
pub fn status_of(response: &str) -> Option<u16> {
    response.split(' ').nth(1)?.parse().ok()
}

/// Body of a raw response.
pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

pub fn temp_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()))
}

/// Throwaway CA plus a `localhost` server certificate on disk.
pub struct TestPki {
    pub dir: PathBuf,
    pub ca_pem: String,
    pub tls: TlsConfig,
}

pub fn generate_pki() -> TestPki {
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

    let dir = temp_path("multiserve-e2e-tls");
    std::fs::create_dir_all(&dir).unwrap();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params.distinguished_name.push(DnType::CommonName, "E2E CA");
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server = CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .signed_by(&server_key, &ca, &ca_key)
        .unwrap();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, server.pem()).unwrap();
    std::fs::write(&key_path, server_key.serialize_pem()).unwrap();

    TestPki {
        ca_pem: ca.pem(),
        tls: TlsConfig {
            cert_path,
            key_path,
            verify: VerifyMode::None,
            ca_path: None,
            allow_proxies: false,
        },
        dir,
    }
}

/// TLS connector trusting the test CA.
pub fn tls_connector(pki: &TestPki) -> tokio_rustls::TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pki.ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}
