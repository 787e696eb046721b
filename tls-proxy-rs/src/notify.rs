//! Operator notifications
//!
//! Invoked when a client asks for a certificate for a hostname the policy
//! does not allow. Delivery is fire-and-forget; a slow or failing target
//! never delays a handshake.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

/// Upper bound on distinct hostnames remembered for de-duplication
const MAX_REMEMBERED_HOSTS: usize = 1024;

/// Hook invoked with the offending hostname
pub trait Notifier: Send + Sync {
    /// A handshake asked for a hostname outside the policy
    fn host_denied(&self, host: &str);
}

/// Log-only notifier
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn host_denied(&self, host: &str) {
        warn!(host = %host, "Rejected certificate request for unknown host");
    }
}

#[derive(Debug, Serialize)]
struct HostDeniedEvent<'a> {
    event: &'static str,
    host: &'a str,
}

/// Posts a JSON event to a webhook, once per hostname
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    seen: Mutex<HashSet<String>>,
}

impl WebhookNotifier {
    /// Create a notifier posting to `url`
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to create webhook client: {}", e)))?;

        Ok(Self {
            client,
            url,
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// Record `host`; false if it was already reported
    fn first_sighting(&self, host: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.contains(host) {
            return false;
        }
        if seen.len() >= MAX_REMEMBERED_HOSTS {
            seen.clear();
        }
        seen.insert(host.to_string())
    }
}

impl Notifier for WebhookNotifier {
    fn host_denied(&self, host: &str) {
        LogNotifier.host_denied(host);

        if !self.first_sighting(host) {
            return;
        }

        let request = self.client.post(&self.url).json(&HostDeniedEvent {
            event: "host_denied",
            host,
        });
        let host = host.to_string();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(host = %host, "Sent host-denied notification");
                }
                Ok(response) => {
                    warn!(host = %host, status = %response.status(), "Notification webhook refused event");
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Failed to send notification");
                }
            }
        });
    }
}
