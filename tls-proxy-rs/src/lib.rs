//! tls-proxy-rs: TLS-terminating reverse proxy with automatic certificates
//!
//! Terminates TLS on port 443 for an allow-listed set of hostnames,
//! obtaining and renewing certificates from an ACME certificate authority
//! on demand, and forwards the decrypted traffic to a single plain-HTTP
//! backend.
//!
//! # Features
//!
//! - Certificates fetched on the first handshake for a hostname, cached on
//!   disk and renewed in the background before they expire
//! - One authority round trip per hostname however many handshakes wait
//! - HTTP-01 and TLS-ALPN-01 domain validation
//! - Port 80 redirect to HTTPS
//! - Streaming request/response forwarding with gateway errors on backend
//!   failure
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! http_addr = "0.0.0.0:80"
//! https_addr = "0.0.0.0:443"
//!
//! [backend]
//! url = "http://127.0.0.1:8080"
//!
//! [acme]
//! cert_dir = "/var/lib/tls-proxy/certs"
//! allowed_hosts = ["example.com", "www.example.com"]
//! email = "admin@example.com"
//! ```

pub mod authority;
pub mod challenge;
pub mod config;
pub mod error;
pub mod manager;
pub mod notify;
pub mod origin;
pub mod policy;
pub mod proxy;
pub mod server;
pub mod singleflight;
pub mod store;
pub mod tls;

pub use authority::{AcmeAuthority, CertificateAuthority, MockAuthority};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use manager::{CertManager, CertState, ManagerSettings};
pub use server::{Listeners, ProxyServer};
