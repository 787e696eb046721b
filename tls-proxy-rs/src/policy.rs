//! Hostname authorization policy
//!
//! Decides which SNI hostnames the proxy is willing to obtain
//! certificates for. The check is synchronous and never touches the
//! network.

use std::collections::BTreeSet;

use crate::error::{ProxyError, Result};

/// Predicate over a hostname presented by a client
pub trait HostPolicy: Send + Sync {
    /// Return `Ok(())` if a certificate may be obtained for `host`
    fn check(&self, host: &str) -> Result<()>;

    /// Hosts known up front, used to warm the certificate cache
    fn known_hosts(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Exact-match allow list of hostnames
#[derive(Debug, Clone)]
pub struct AllowList {
    hosts: BTreeSet<String>,
}

impl AllowList {
    /// Build an allow list. An empty list is a configuration error since it
    /// would deny every handshake.
    pub fn new<I, S>(hosts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for host in hosts {
            let raw = host.as_ref();
            let normalized = normalize_host(raw)
                .ok_or_else(|| ProxyError::Config(format!("Invalid hostname '{}'", raw)))?;
            set.insert(normalized);
        }

        if set.is_empty() {
            return Err(ProxyError::Config(
                "At least one allowed hostname is required".to_string(),
            ));
        }

        Ok(Self { hosts: set })
    }

    /// Whether `host` is on the list
    pub fn is_allowed(&self, host: &str) -> bool {
        normalize_host(host)
            .map(|h| self.hosts.contains(&h))
            .unwrap_or(false)
    }
}

impl HostPolicy for AllowList {
    fn check(&self, host: &str) -> Result<()> {
        if self.is_allowed(host) {
            Ok(())
        } else {
            Err(ProxyError::PolicyDenied(host.to_string()))
        }
    }

    fn known_hosts(&self) -> Vec<String> {
        self.hosts.iter().cloned().collect()
    }
}

/// Lowercase a DNS name and drop a trailing dot.
///
/// Returns `None` for anything that cannot be a DNS hostname (empty labels,
/// ports, path separators, IP literals in brackets).
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.');
    if host.is_empty() || host.len() > 253 {
        return None;
    }

    let valid = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });

    if valid {
        Some(host.to_ascii_lowercase())
    } else {
        None
    }
}
