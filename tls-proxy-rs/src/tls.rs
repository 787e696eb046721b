//! TLS termination
//!
//! Certificates are chosen per handshake: the ClientHello is read first,
//! the SNI hostname is handed to the [`CertManager`], and only then is a
//! rustls `ServerConfig` built around the certificate it returns.
//! Handshakes offering the `acme-tls/1` ALPN protocol are answered with the
//! validation certificate from the [`ChallengeResponder`] instead.

use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::Item;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

use crate::challenge::{ChallengeResponder, ACME_TLS_ALPN_PROTOCOL};
use crate::error::{ProxyError, Result};
use crate::manager::CertManager;

/// ALPN protocols offered for application traffic
pub const HTTP_ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Convert a PEM private key and certificate chain into a rustls key
pub fn certified_key_from_pem(key_pem: &str, chain_pem: &str) -> Result<CertifiedKey> {
    let mut cert_reader = chain_pem.as_bytes();
    let certs_der = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificates: {}", e)))?;

    if certs_der.is_empty() {
        return Err(ProxyError::Tls("No certificates found in chain".to_string()));
    }

    // Accept PKCS8, RSA and SEC1 keys; the first key block wins
    let mut key_reader = key_pem.as_bytes();
    let mut key = None;
    loop {
        match rustls_pemfile::read_one(&mut key_reader)
            .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?
        {
            Some(Item::PKCS8Key(der)) | Some(Item::RSAKey(der)) | Some(Item::ECKey(der)) => {
                key = Some(rustls::PrivateKey(der));
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    let key = key.ok_or_else(|| ProxyError::Tls("No private key found".to_string()))?;

    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Tls(format!("Unsupported private key: {}", e)))?;

    let certs = certs_der.into_iter().map(rustls::Certificate).collect();
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Resolver that always presents the same certificate, or none at all.
///
/// A resolver returning `None` makes rustls abort the handshake with a
/// `handshake_failure` alert, which is how certificate errors reach the
/// client.
struct FixedCert(Option<Arc<CertifiedKey>>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.0.clone()
    }
}

/// Build a server config presenting `key` with the given ALPN protocols
pub fn server_config(key: Option<Arc<CertifiedKey>>, alpn: &[&[u8]]) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(key)));
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Outcome of a successful TLS accept
pub enum Accepted {
    /// Handshake for application traffic
    Http(TlsStream<TcpStream>),
    /// TLS-ALPN-01 validation handshake; the connection carries no data
    Challenge,
}

/// Terminates TLS on accepted TCP connections
#[derive(Clone)]
pub struct TlsTerminator {
    manager: Arc<CertManager>,
    handshake_timeout: Duration,
}

impl TlsTerminator {
    /// Create a terminator backed by `manager`
    pub fn new(manager: Arc<CertManager>, handshake_timeout: Duration) -> Self {
        Self {
            manager,
            handshake_timeout,
        }
    }

    /// Run the TLS handshake, fetching the certificate for the SNI hostname
    pub async fn accept(&self, stream: TcpStream) -> Result<Accepted> {
        let start = tokio::time::timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .map_err(|_| ProxyError::Tls("Timed out waiting for ClientHello".to_string()))??;

        let hello = start.client_hello();
        let server_name = hello.server_name().map(str::to_owned);
        let is_challenge = hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_PROTOCOL))
            .unwrap_or(false);

        let (config, failure) = if is_challenge {
            match self.challenge_certificate(server_name.as_deref()).await {
                Some(key) => (server_config(Some(key), &[ACME_TLS_ALPN_PROTOCOL]), None),
                None => (
                    server_config(None, &[]),
                    Some(ProxyError::Tls(format!(
                        "No pending TLS-ALPN challenge for {:?}",
                        server_name
                    ))),
                ),
            }
        } else {
            match self.manager.certificate_for(server_name.as_deref()).await {
                Ok(cert) => (
                    server_config(Some(cert.certified_key.clone()), &HTTP_ALPN_PROTOCOLS),
                    None,
                ),
                Err(e) => {
                    debug!(sni = ?server_name, error = %e, "Rejecting handshake");
                    (server_config(None, &[]), Some(e))
                }
            }
        };

        let handshake = tokio::time::timeout(self.handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| ProxyError::Tls("TLS handshake timed out".to_string()))?;

        if let Some(e) = failure {
            return Err(e);
        }

        let tls = handshake?;
        if is_challenge {
            debug!(sni = ?server_name, "Answered TLS-ALPN-01 validation handshake");
            return Ok(Accepted::Challenge);
        }
        Ok(Accepted::Http(tls))
    }

    async fn challenge_certificate(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(host) = server_name else {
            warn!("TLS-ALPN-01 handshake without server name");
            return None;
        };
        let responder: &ChallengeResponder = self.manager.challenges();
        responder.alpn_certificate(host).await
    }
}
