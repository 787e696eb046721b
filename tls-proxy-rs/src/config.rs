//! Configuration for tls-proxy-rs
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, `TLS_PROXY__SECTION__KEY` environment variables, then the flat
//! variables `CERT_DIR`, `BACKEND_URL`, `ALLOWED_HOSTS`, `ACME_EMAIL` and
//! `NOTIFY_WEBHOOK`.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::authority::LETS_ENCRYPT_PRODUCTION;
use crate::error::{ProxyError, Result};
use crate::manager::ManagerSettings;
use crate::origin::BackendOrigin;
use crate::policy::AllowList;

/// Lifetime of a default Let's Encrypt certificate
const STANDARD_CERT_LIFETIME_DAYS: i64 = 90;

/// Main proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend origin
    pub backend: BackendConfig,
    /// Certificate acquisition
    pub acme: AcmeConfig,
    /// Denied-host notifications
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain HTTP listener (redirects and HTTP-01 challenges)
    pub http_addr: String,
    /// TLS listener
    pub https_addr: String,
    /// Wait for backend response headers
    pub backend_timeout_seconds: u64,
    /// Backend TCP connect timeout
    pub connect_timeout_seconds: u64,
    /// ClientHello read and handshake completion timeout
    pub handshake_timeout_seconds: u64,
    /// Time in-flight connections get after a shutdown signal
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:80".to_string(),
            https_addr: "0.0.0.0:443".to_string(),
            backend_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            handshake_timeout_seconds: 10,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Backend URL (e.g., "http://127.0.0.1:8080")
    pub url: String,
}

/// ACME configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcmeConfig {
    /// Certificate cache directory
    pub cert_dir: PathBuf,
    /// Hostnames certificates may be obtained for
    pub allowed_hosts: Vec<String>,
    /// Contact email for the ACME account
    #[serde(default)]
    pub email: Option<String>,
    /// ACME directory URL
    #[serde(default = "default_acme_directory")]
    pub directory: String,
    /// Renew certificates this many days before expiry
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,
    /// Upper bound on one complete ACME order
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Attempts per on-demand acquisition
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay
    #[serde(default = "default_retry_initial")]
    pub retry_initial_seconds: u64,
    /// Retry delay ceiling
    #[serde(default = "default_retry_max")]
    pub retry_max_seconds: u64,
}

/// Notification configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Webhook receiving a JSON event per denied hostname
    pub webhook_url: Option<String>,
}

fn default_acme_directory() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_initial() -> u64 {
    5
}

fn default_retry_max() -> u64 {
    3600
}

impl ProxyConfig {
    /// Load configuration from all sources and validate it
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Load with `lookup` standing in for the flat environment variables
    pub(crate) fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TLS_PROXY")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("acme.allowed_hosts")
                .try_parsing(true),
        );

        let allowed_hosts = lookup("ALLOWED_HOSTS").map(|hosts| {
            hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        builder = builder
            .set_override_option("acme.cert_dir", lookup("CERT_DIR"))?
            .set_override_option("backend.url", lookup("BACKEND_URL"))?
            .set_override_option("acme.allowed_hosts", allowed_hosts)?
            .set_override_option("acme.email", lookup("ACME_EMAIL"))?
            .set_override_option("notify.webhook_url", lookup("NOTIFY_WEBHOOK"))?;

        let config: ProxyConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("http_addr", &self.server.http_addr),
            ("https_addr", &self.server.https_addr),
        ] {
            addr.parse::<SocketAddr>().map_err(|e| {
                ProxyError::Config(format!("Invalid server.{} '{}': {}", name, addr, e))
            })?;
        }

        for (name, value) in [
            ("backend_timeout_seconds", self.server.backend_timeout_seconds),
            ("connect_timeout_seconds", self.server.connect_timeout_seconds),
            ("handshake_timeout_seconds", self.server.handshake_timeout_seconds),
            ("request_timeout_seconds", self.acme.request_timeout_seconds),
            ("retry_initial_seconds", self.acme.retry_initial_seconds),
        ] {
            if value == 0 {
                return Err(ProxyError::Config(format!("{} must be positive", name)));
            }
        }

        BackendOrigin::parse(&self.backend.url)?;

        if self.acme.cert_dir.as_os_str().is_empty() {
            return Err(ProxyError::Config("acme.cert_dir is required".to_string()));
        }
        AllowList::new(&self.acme.allowed_hosts)?;

        if let Some(email) = &self.acme.email {
            if !email.contains('@') {
                return Err(ProxyError::Config(format!("Invalid acme.email '{}'", email)));
            }
        }
        url::Url::parse(&self.acme.directory).map_err(|e| {
            ProxyError::Config(format!("Invalid acme.directory '{}': {}", self.acme.directory, e))
        })?;

        if self.acme.renew_before_days <= 0 {
            return Err(ProxyError::Config(
                "acme.renew_before_days must be positive".to_string(),
            ));
        }
        if self.acme.renew_before_days >= STANDARD_CERT_LIFETIME_DAYS {
            warn!(
                renew_before_days = self.acme.renew_before_days,
                "acme.renew_before_days covers a whole certificate lifetime; renewals will be rate-held"
            );
        }
        if self.acme.max_attempts == 0 {
            return Err(ProxyError::Config("acme.max_attempts must be at least 1".to_string()));
        }
        if self.acme.retry_max_seconds < self.acme.retry_initial_seconds {
            return Err(ProxyError::Config(
                "acme.retry_max_seconds must not be below acme.retry_initial_seconds".to_string(),
            ));
        }

        if let Some(webhook) = &self.notify.webhook_url {
            let url = url::Url::parse(webhook).map_err(|e| {
                ProxyError::Config(format!("Invalid notify.webhook_url '{}': {}", webhook, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ProxyError::Config(format!(
                    "notify.webhook_url '{}' must be http or https",
                    webhook
                )));
            }
        }

        Ok(())
    }

    /// Lifecycle manager tunables
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            renew_before: chrono::Duration::days(self.acme.renew_before_days),
            max_attempts: self.acme.max_attempts,
            retry_initial: Duration::from_secs(self.acme.retry_initial_seconds),
            retry_max: Duration::from_secs(self.acme.retry_max_seconds),
        }
    }

    /// Backend response timeout
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.server.backend_timeout_seconds)
    }

    /// Backend connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_seconds)
    }

    /// TLS handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.server.handshake_timeout_seconds)
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_seconds)
    }

    /// ACME order timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.acme.request_timeout_seconds)
    }
}
