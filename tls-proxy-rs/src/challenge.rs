//! ACME domain-validation challenge responder
//!
//! Holds the state of in-progress validations so both listeners can answer
//! the certificate authority:
//!
//! - HTTP-01: the port-80 listener serves the key authorization at
//!   `/.well-known/acme-challenge/{token}`
//! - TLS-ALPN-01: the port-443 listener presents a self-signed validation
//!   certificate to handshakes offering the `acme-tls/1` protocol

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::policy::normalize_host;
use crate::tls::certified_key_from_pem;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// ALPN protocol identifier used only by TLS-ALPN-01 validation
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Pending challenge responses, shared by the HTTP and TLS listeners
#[derive(Default)]
pub struct ChallengeResponder {
    /// HTTP-01: token -> key authorization
    http_tokens: RwLock<HashMap<String, String>>,
    /// TLS-ALPN-01: hostname -> validation certificate
    alpn_certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeResponder {
    /// Create an empty responder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an HTTP-01 challenge response
    pub async fn add_http_token(&self, token: &str, key_authorization: &str) {
        let mut tokens = self.http_tokens.write().await;
        tokens.insert(token.to_string(), key_authorization.to_string());
        debug!(token = %token, "Added HTTP-01 challenge");
    }

    /// Remove an HTTP-01 challenge (after validation)
    pub async fn remove_http_token(&self, token: &str) {
        let mut tokens = self.http_tokens.write().await;
        if tokens.remove(token).is_some() {
            debug!(token = %token, "Removed HTTP-01 challenge");
        }
    }

    /// Key authorization for a token, if a validation is in progress
    pub async fn http_response(&self, token: &str) -> Option<String> {
        self.http_tokens.read().await.get(token).cloned()
    }

    /// Generate and register the TLS-ALPN-01 certificate for `host`.
    ///
    /// `key_authorization_digest` is the SHA-256 of the key authorization,
    /// embedded in the critical `acmeIdentifier` extension (RFC 8737).
    pub async fn add_alpn_certificate(&self, host: &str, key_authorization_digest: &[u8]) -> Result<()> {
        let key = alpn_validation_certificate(host, key_authorization_digest)?;
        let host = normalize_host(host).unwrap_or_else(|| host.to_string());

        let mut certs = self.alpn_certs.write().await;
        certs.insert(host.clone(), Arc::new(key));
        debug!(host = %host, "Added TLS-ALPN-01 challenge certificate");
        Ok(())
    }

    /// Remove the TLS-ALPN-01 certificate for `host`
    pub async fn remove_alpn_certificate(&self, host: &str) {
        let host = normalize_host(host).unwrap_or_else(|| host.to_string());
        let mut certs = self.alpn_certs.write().await;
        if certs.remove(&host).is_some() {
            debug!(host = %host, "Removed TLS-ALPN-01 challenge certificate");
        }
    }

    /// Validation certificate for `host`, if a TLS-ALPN-01 validation is in progress
    pub async fn alpn_certificate(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let host = normalize_host(host)?;
        self.alpn_certs.read().await.get(&host).cloned()
    }

    /// Number of pending challenges of both kinds
    pub async fn pending_count(&self) -> usize {
        self.http_tokens.read().await.len() + self.alpn_certs.read().await.len()
    }
}

fn alpn_validation_certificate(host: &str, digest: &[u8]) -> Result<CertifiedKey> {
    let mut params = rcgen::CertificateParams::new(vec![host.to_string()])
        .map_err(|e| ProxyError::Tls(format!("Invalid challenge hostname: {}", e)))?;
    params
        .custom_extensions
        .push(rcgen::CustomExtension::new_acme_identifier(digest));

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| ProxyError::Tls(format!("Failed to generate challenge key: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Tls(format!("Failed to generate challenge certificate: {}", e)))?;

    certified_key_from_pem(&key_pair.serialize_pem(), &cert.pem())
}

/// HTTP handler for ACME challenges
/// Mount this at `/.well-known/acme-challenge/{token}`
pub async fn acme_challenge_handler(
    State(responder): State<Arc<ChallengeResponder>>,
    Path(token): Path<String>,
) -> Response {
    match responder.http_response(&token).await {
        Some(key_authorization) => {
            debug!(token = %token, "Served HTTP-01 challenge");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                key_authorization,
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}
