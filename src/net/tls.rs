//! TLS termination for accepted connections.
//!
//! # Responsibilities
//! - Load the server certificate chain and key (PEM)
//! - Configure client verification (none / optional / required)
//! - Run the server-side handshake on an accepted socket
//! - Extract subject/issuer names from a presented client certificate
//!
//! # Design Decisions
//! - The `ring` provider is pinned explicitly, so no process-wide default
//!   provider has to be installed
//! - Handshake failures are returned to the caller, which logs and drops
//!   the connection; they never reach the accept loop

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use x509_parser::objects::{oid2abbrev, oid_registry};
use x509_parser::x509::X509Name;

use crate::config::{TlsConfig, VerifyMode};

/// Errors building the TLS context or completing a handshake.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("client verification '{0:?}' needs a CA bundle")]
    MissingCa(VerifyMode),
    #[error("X.509 proxy certificates are not supported")]
    ProxiesUnsupported,
    #[error("client verifier: {0}")]
    Verifier(String),
    #[error("TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
}

/// Distinguished names of a client certificate, as `k=v,k=v` strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerIdentity {
    pub subject: Option<String>,
    pub issuer: Option<String>,
}

/// Upgrades accepted sockets to TLS.
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    verify: VerifyMode,
}

impl std::fmt::Debug for TlsTerminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTerminator").field("verify", &self.verify).finish()
    }
}

impl TlsTerminator {
    /// Build the server context from configuration.
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        if config.allow_proxies {
            return Err(TlsError::ProxiesUnsupported);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let certs = load_certs(&config.cert_path)?;
        let key = load_key(&config.key_path)?;

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = match config.verify {
            VerifyMode::None => builder.with_no_client_auth(),
            mode => {
                let ca_path = config.ca_path.as_ref().ok_or(TlsError::MissingCa(mode))?;
                let mut roots = RootCertStore::empty();
                let (added, ignored) = roots.add_parsable_certificates(load_certs(ca_path)?);
                tracing::debug!(added, ignored, ca = ?ca_path, "Loaded client CA bundle");

                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                let verifier = if mode == VerifyMode::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                let verifier = verifier
                    .build()
                    .map_err(|e| TlsError::Verifier(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let server_config = builder.with_single_cert(certs, key)?;

        tracing::info!(
            cert = ?config.cert_path,
            verify = ?config.verify,
            "TLS enabled"
        );

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            verify: config.verify,
        })
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify
    }

    /// Run the handshake. Returns the TLS stream and, if the client sent a
    /// certificate, its names.
    pub async fn wrap(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, Option<PeerIdentity>), TlsError> {
        let tls = self.acceptor.accept(stream).await.map_err(TlsError::Handshake)?;
        let identity = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|leaf| peer_identity(leaf.as_ref()));
        Ok((tls, identity))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Parse a DER certificate and format its subject and issuer.
pub fn peer_identity(der: &[u8]) -> Option<PeerIdentity> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    Some(PeerIdentity {
        subject: Some(format_name(cert.subject())),
        issuer: Some(format_name(cert.issuer())),
    })
}

/// `CN=alice,O=Example`: short attribute names where known, dotted OIDs
/// otherwise, in certificate order.
fn format_name(name: &X509Name<'_>) -> String {
    let registry = oid_registry();
    let mut parts = Vec::new();
    for rdn in name.iter() {
        for attr in rdn.iter() {
            let key = oid2abbrev(attr.attr_type(), registry)
                .map(str::to_string)
                .unwrap_or_else(|_| attr.attr_type().to_id_string());
            let value = attr.as_str().unwrap_or("?");
            parts.push(format!("{key}={value}"));
        }
    }
    parts.join(",")
}
