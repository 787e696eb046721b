//! Certificate cache
//!
//! Durable storage for issued certificates, one record per hostname.
//!
//! # Directory Structure
//!
//! ```text
//! cert_dir/
//! ├── acme_account.json     # ACME account credentials
//! ├── example.com           # private key PEM followed by the certificate chain PEM
//! └── www.example.com
//! ```
//!
//! Each record is a single file replaced with write-to-temp + rename, so a
//! concurrent reader sees either the previous record or the new one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, trace};

use crate::error::{ProxyError, Result};
use crate::policy::normalize_host;

const CERT_PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";

/// A hostname's private key, certificate chain and expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Hostname the certificate was issued for
    pub hostname: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// PEM-encoded certificate chain, leaf first
    pub chain_pem: String,
    /// `notAfter` of the leaf certificate
    pub expires_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a record, reading the expiry from the leaf certificate
    pub fn new(hostname: &str, key_pem: String, chain_pem: String) -> Result<Self> {
        if !key_pem.contains("PRIVATE KEY-----") {
            return Err(ProxyError::Tls(format!(
                "No private key in record for {}",
                hostname
            )));
        }
        let expires_at = leaf_expiry(&chain_pem)?;

        Ok(Self {
            hostname: hostname.to_string(),
            key_pem,
            chain_pem,
            expires_at,
        })
    }

    /// Whether the certificate is past its `notAfter`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the certificate expires within `window` of `now`
    pub fn needs_renewal(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now + window >= self.expires_at
    }

    fn to_file_contents(&self) -> String {
        let mut out = String::with_capacity(self.key_pem.len() + self.chain_pem.len());
        out.push_str(&self.key_pem);
        out.push_str(&self.chain_pem);
        out
    }

    fn from_file_contents(hostname: &str, contents: &str) -> Result<Self> {
        let split = contents.find(CERT_PEM_BEGIN).ok_or_else(|| {
            ProxyError::Store(format!("Cached record for {} has no certificate", hostname))
        })?;
        let (key_pem, chain_pem) = contents.split_at(split);
        Self::new(hostname, key_pem.to_string(), chain_pem.to_string())
    }
}

/// Read the `notAfter` timestamp of the first certificate in a PEM chain
pub fn leaf_expiry(chain_pem: &str) -> Result<DateTime<Utc>> {
    let mut reader = chain_pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificate chain: {}", e)))?;
    let leaf = certs
        .first()
        .ok_or_else(|| ProxyError::Tls("Certificate chain is empty".to_string()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf)
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate: {}", e)))?;
    let timestamp = cert.validity().not_after.timestamp();

    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| ProxyError::Tls(format!("Certificate expiry out of range: {}", timestamp)))
}

/// Durable key/certificate cache keyed by hostname
#[async_trait::async_trait]
pub trait CertificateStore: Send + Sync {
    /// Load the record for `hostname`, `None` if nothing is cached
    async fn get(&self, hostname: &str) -> Result<Option<CertificateRecord>>;

    /// Atomically replace the record for `record.hostname`
    async fn put(&self, record: &CertificateRecord) -> Result<()>;
}

/// Filesystem-backed certificate store
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    /// Open (and create if needed) a cache directory with 0700 permissions
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            ProxyError::Store(format!("Failed to create cache directory {:?}: {}", dir, e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|e| {
                ProxyError::Store(format!("Failed to restrict cache directory: {}", e))
            })?;
        }

        info!(path = %dir.display(), "Opened certificate cache");
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, hostname: &str) -> Result<PathBuf> {
        let name = normalize_host(hostname).ok_or_else(|| {
            ProxyError::Store(format!("Refusing to cache invalid hostname '{}'", hostname))
        })?;
        Ok(self.dir.join(name))
    }
}

#[async_trait::async_trait]
impl CertificateStore for DirStore {
    async fn get(&self, hostname: &str) -> Result<Option<CertificateRecord>> {
        let path = self.record_path(hostname)?;

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(host = %hostname, "No cached certificate");
                return Ok(None);
            }
            Err(e) => {
                return Err(ProxyError::Store(format!(
                    "Failed to read cached certificate for {}: {}",
                    hostname, e
                )))
            }
        };

        let record = CertificateRecord::from_file_contents(hostname, &contents)?;
        debug!(host = %hostname, expires = %record.expires_at, "Loaded cached certificate");
        Ok(Some(record))
    }

    async fn put(&self, record: &CertificateRecord) -> Result<()> {
        let path = self.record_path(&record.hostname)?;
        write_atomic(&path, record.to_file_contents().into_bytes()).await?;

        info!(
            host = %record.hostname,
            expires = %record.expires_at,
            "Saved certificate to cache"
        );
        Ok(())
    }
}

/// Write `contents` to a temp file next to `path`, fsync, then rename over it
pub(crate) async fn write_atomic(path: &Path, contents: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &contents))
        .await
        .map_err(|e| ProxyError::Store(format!("Cache write task failed: {}", e)))?
}

fn write_atomic_blocking(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ProxyError::Store(format!("No parent directory for {:?}", path)))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ProxyError::Store(format!("Failed to create temp file in {:?}: {}", dir, e)))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| ProxyError::Store(format!("Failed to write {:?}: {}", path, e)))?;

    // NamedTempFile is created with 0600 on unix
    tmp.persist(path)
        .map_err(|e| ProxyError::Store(format!("Failed to replace {:?}: {}", path, e.error)))?;
    Ok(())
}
