//! Certificate lifecycle management
//!
//! Per hostname the manager moves through
//! `Unknown → Pending → Valid → Renewing → Valid`, or ends up `Expired`
//! when renewal keeps failing past the certificate's `notAfter`.
//!
//! - Hostnames are checked against the [`HostPolicy`] before anything else;
//!   a denial never reaches the store or the certificate authority.
//! - Acquisition of a new certificate runs once per hostname no matter how
//!   many handshakes ask for it concurrently ([`SingleFlight`]).
//! - Renewal is lazy: a handshake that sees a certificate inside the renewal
//!   window still gets that certificate, and a background task replaces it.
//! - A freshly issued certificate that already sits inside the renewal
//!   window (short-lived profiles, large `renew_before`) is held back from
//!   renewal for a third of its lifetime, and never less than `retry_max`.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::authority::CertificateAuthority;
use crate::challenge::ChallengeResponder;
use crate::error::{ProxyError, Result};
use crate::notify::{LogNotifier, Notifier};
use crate::policy::{normalize_host, HostPolicy};
use crate::singleflight::SingleFlight;
use crate::store::{CertificateRecord, CertificateStore};
use crate::tls::certified_key_from_pem;

/// Tunables for acquisition and renewal
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Renew once a certificate is this close to expiry
    pub renew_before: chrono::Duration,
    /// Attempts per on-demand acquisition before giving up
    pub max_attempts: u32,
    /// First retry delay, doubled after each failure
    pub retry_initial: Duration,
    /// Retry delay ceiling, also the cool-down after a rejection
    pub retry_max: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            renew_before: chrono::Duration::days(30),
            max_attempts: 3,
            retry_initial: Duration::from_secs(5),
            retry_max: Duration::from_secs(3600),
        }
    }
}

/// Lifecycle state of a hostname's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    /// Nothing cached in memory
    Unknown,
    /// First acquisition in progress
    Pending,
    /// Cached and outside the renewal window
    Valid,
    /// Cached, still served, background renewal running
    Renewing,
    /// Cached certificate is past its expiry
    Expired,
}

/// A certificate ready to be presented in handshakes
pub struct ManagedCertificate {
    /// Stored record
    pub record: CertificateRecord,
    /// rustls form of the record
    pub certified_key: Arc<CertifiedKey>,
}

impl ManagedCertificate {
    /// Parse a record's PEM material into a rustls key
    pub fn from_record(record: CertificateRecord) -> Result<Self> {
        let certified_key = certified_key_from_pem(&record.key_pem, &record.chain_pem)?;
        Ok(Self {
            record,
            certified_key: Arc::new(certified_key),
        })
    }
}

type Acquisition = Result<Arc<ManagedCertificate>>;

/// Certificate lifecycle manager
pub struct CertManager {
    store: Arc<dyn CertificateStore>,
    policy: Arc<dyn HostPolicy>,
    authority: Arc<dyn CertificateAuthority>,
    challenges: Arc<ChallengeResponder>,
    notifier: Arc<dyn Notifier>,
    settings: ManagerSettings,
    cache: RwLock<HashMap<String, Arc<ManagedCertificate>>>,
    acquisitions: SingleFlight<String, Acquisition>,
    renewals: DashMap<String, ()>,
    cooldowns: DashMap<String, Instant>,
    renew_holds: DashMap<String, Instant>,
}

impl CertManager {
    /// Create a manager from its collaborators
    pub fn new(
        store: Arc<dyn CertificateStore>,
        policy: Arc<dyn HostPolicy>,
        authority: Arc<dyn CertificateAuthority>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            policy,
            authority,
            challenges: Arc::new(ChallengeResponder::new()),
            notifier: Arc::new(LogNotifier),
            settings,
            cache: RwLock::new(HashMap::new()),
            acquisitions: SingleFlight::new(),
            renewals: DashMap::new(),
            cooldowns: DashMap::new(),
            renew_holds: DashMap::new(),
        }
    }

    /// Replace the denied-host notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Challenge responder shared with the listeners
    pub fn challenges(&self) -> &Arc<ChallengeResponder> {
        &self.challenges
    }

    /// Certificate to present for a handshake carrying `server_name`.
    ///
    /// Called on every TLS handshake. Returns immediately for cached
    /// certificates, drives acquisition for new hostnames.
    pub async fn certificate_for(
        self: &Arc<Self>,
        server_name: Option<&str>,
    ) -> Result<Arc<ManagedCertificate>> {
        let raw = server_name
            .ok_or_else(|| ProxyError::Tls("Client did not send a server name".to_string()))?;
        debug!(sni = %raw, "Certificate requested");

        if let Err(e) = self.policy.check(raw) {
            self.notifier.host_denied(raw);
            return Err(e);
        }
        let host = normalize_host(raw).ok_or_else(|| ProxyError::PolicyDenied(raw.to_string()))?;

        if let Some(cert) = self.cached(&host).await {
            return self.serve(&host, cert);
        }

        self.check_cooldown(&host)?;

        let manager = Arc::clone(self);
        let key = host.clone();
        let cert = self
            .acquisitions
            .run(host.clone(), move || async move { manager.load_or_acquire(&key).await })
            .await
            .unwrap_or_else(|| {
                Err(ProxyError::AcquisitionTransient(format!(
                    "Acquisition for {} aborted",
                    host
                )))
            })?;

        self.serve(&host, cert)
    }

    /// Current lifecycle state of `host`
    pub async fn state(&self, host: &str) -> CertState {
        let Some(host) = normalize_host(host) else {
            return CertState::Unknown;
        };
        if self.acquisitions.in_flight(&host) {
            return CertState::Pending;
        }
        let Some(cert) = self.cached(&host).await else {
            return CertState::Unknown;
        };

        if cert.record.is_expired(Utc::now()) {
            CertState::Expired
        } else if self.renewals.contains_key(&host) {
            CertState::Renewing
        } else {
            CertState::Valid
        }
    }

    /// Load still-valid certificates for the policy's known hosts into memory
    pub async fn preload(&self) -> usize {
        let mut loaded = 0;
        for host in self.policy.known_hosts() {
            match self.store.get(&host).await {
                Ok(Some(record)) if !record.is_expired(Utc::now()) => {
                    match ManagedCertificate::from_record(record) {
                        Ok(cert) => {
                            info!(host = %host, expires = %cert.record.expires_at, "Preloaded certificate");
                            self.cache_insert(Arc::new(cert)).await;
                            loaded += 1;
                        }
                        Err(e) => warn!(host = %host, error = %e, "Cached certificate is unusable"),
                    }
                }
                Ok(Some(record)) => {
                    info!(host = %host, expired = %record.expires_at, "Cached certificate has expired");
                }
                Ok(None) => debug!(host = %host, "No cached certificate"),
                Err(e) => warn!(host = %host, error = %e, "Failed to read certificate cache"),
            }
        }
        loaded
    }

    fn serve(self: &Arc<Self>, host: &str, cert: Arc<ManagedCertificate>) -> Acquisition {
        let now = Utc::now();
        if cert.record.is_expired(now) {
            self.schedule_renewal(host);
            return Err(ProxyError::Tls(format!(
                "Certificate for {} expired at {}",
                host, cert.record.expires_at
            )));
        }
        if cert.record.needs_renewal(now, self.settings.renew_before) {
            self.schedule_renewal(host);
        }
        Ok(cert)
    }

    async fn cached(&self, host: &str) -> Option<Arc<ManagedCertificate>> {
        self.cache.read().await.get(host).cloned()
    }

    async fn cache_insert(&self, cert: Arc<ManagedCertificate>) {
        let mut cache = self.cache.write().await;
        cache.insert(cert.record.hostname.clone(), cert);
    }

    async fn load_or_acquire(&self, host: &str) -> Acquisition {
        // An earlier flight may have filled the cache while this one queued
        if let Some(cert) = self.cached(host).await {
            return Ok(cert);
        }

        match self.store.get(host).await? {
            Some(record) if !record.is_expired(Utc::now()) => {
                let cert = Arc::new(ManagedCertificate::from_record(record)?);
                info!(host = %host, expires = %cert.record.expires_at, "Loaded certificate from cache");
                self.cache_insert(cert.clone()).await;
                return Ok(cert);
            }
            Some(record) => {
                info!(host = %host, expired = %record.expires_at, "Cached certificate expired, requesting a new one");
            }
            None => info!(host = %host, "No certificate cached, requesting one"),
        }

        self.acquire(host).await
    }

    async fn acquire(&self, host: &str) -> Acquisition {
        let mut delay = self.settings.retry_initial;
        let mut attempt = 1;

        loop {
            match self.issue_and_store(host).await {
                Ok(cert) => return Ok(cert),
                Err(e) if e.is_transient() && attempt < self.settings.max_attempts => {
                    warn!(
                        host = %host,
                        attempt,
                        error = %e,
                        retry_in = ?delay,
                        "Certificate acquisition failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.settings.retry_max);
                    attempt += 1;
                }
                Err(e) => {
                    if matches!(e, ProxyError::AcquisitionFatal(_)) {
                        self.start_cooldown(host);
                    }
                    error!(host = %host, attempt, error = %e, "Certificate acquisition failed");
                    return Err(e);
                }
            }
        }
    }

    async fn issue_and_store(&self, host: &str) -> Acquisition {
        let issued = self.authority.issue(host, &self.challenges).await?;
        let record = CertificateRecord::new(host, issued.key_pem, issued.chain_pem)?;
        let cert = Arc::new(ManagedCertificate::from_record(record)?);

        self.store.put(&cert.record).await?;
        self.cache_insert(cert.clone()).await;
        self.hold_renewal(&cert.record);

        info!(host = %host, expires = %cert.record.expires_at, "Obtained certificate");
        Ok(cert)
    }

    fn schedule_renewal(self: &Arc<Self>, host: &str) {
        if self.check_cooldown(host).is_err() || self.renewal_held(host) {
            return;
        }
        match self.renewals.entry(host.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        let manager = Arc::clone(self);
        let host = host.to_string();
        tokio::spawn(async move {
            manager.renew(&host).await;
            manager.renewals.remove(&host);
        });
    }

    /// Retry with backoff until the renewal lands or the authority refuses
    async fn renew(&self, host: &str) {
        info!(host = %host, "Renewing certificate");
        let mut delay = self.settings.retry_initial;

        loop {
            match self.issue_and_store(host).await {
                Ok(_) => {
                    info!(host = %host, "Certificate renewed");
                    return;
                }
                Err(e @ ProxyError::AcquisitionFatal(_)) => {
                    error!(host = %host, error = %e, "Certificate renewal rejected");
                    self.start_cooldown(host);
                    return;
                }
                Err(e) => {
                    warn!(host = %host, error = %e, retry_in = ?delay, "Certificate renewal failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.settings.retry_max);
                }
            }
        }
    }

    /// Hold off renewal of a just-issued certificate that is already due
    fn hold_renewal(&self, record: &CertificateRecord) {
        let now = Utc::now();
        let retry_max = chrono::Duration::from_std(self.settings.retry_max)
            .unwrap_or(self.settings.renew_before);
        if record.expires_at - self.settings.renew_before > now + retry_max {
            self.renew_holds.remove(&record.hostname);
            return;
        }

        let lifetime = record.expires_at - now;
        warn!(
            host = %record.hostname,
            expires = %record.expires_at,
            renew_before_days = self.settings.renew_before.num_days(),
            "Issued certificate lifetime is within the renewal window"
        );
        let hold = (lifetime / 3)
            .min(self.settings.renew_before)
            .to_std()
            .unwrap_or_default()
            .max(self.settings.retry_max);
        self.renew_holds
            .insert(record.hostname.clone(), Instant::now() + hold);
    }

    fn renewal_held(&self, host: &str) -> bool {
        let until = match self.renew_holds.get(host) {
            Some(until) => *until,
            None => return false,
        };
        if Instant::now() < until {
            return true;
        }
        self.renew_holds.remove(host);
        false
    }

    fn start_cooldown(&self, host: &str) {
        self.cooldowns
            .insert(host.to_string(), Instant::now() + self.settings.retry_max);
    }

    fn check_cooldown(&self, host: &str) -> Result<()> {
        let until = match self.cooldowns.get(host) {
            Some(until) => *until,
            None => return Ok(()),
        };
        if Instant::now() < until {
            return Err(ProxyError::AcquisitionFatal(format!(
                "Certificate authority recently rejected {}",
                host
            )));
        }
        self.cooldowns.remove(host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MockAuthority;
    use crate::policy::AllowList;
    use crate::store::DirStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingNotifier {
        hosts: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn host_denied(&self, host: &str) {
            self.hosts.lock().unwrap().push(host.to_string());
        }
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl CertificateStore for FailingStore {
        async fn get(&self, _hostname: &str) -> Result<Option<CertificateRecord>> {
            Err(ProxyError::Store("permission denied".to_string()))
        }

        async fn put(&self, _record: &CertificateRecord) -> Result<()> {
            Err(ProxyError::Store("disk full".to_string()))
        }
    }

    fn fast_settings() -> ManagerSettings {
        ManagerSettings {
            renew_before: chrono::Duration::days(30),
            max_attempts: 3,
            retry_initial: Duration::from_millis(10),
            retry_max: Duration::from_millis(50),
        }
    }

    fn manager_with(
        dir: &TempDir,
        authority: Arc<MockAuthority>,
        settings: ManagerSettings,
    ) -> Arc<CertManager> {
        let store = Arc::new(DirStore::new(dir.path()).unwrap());
        let policy = Arc::new(AllowList::new(["example.com", "www.example.com"]).unwrap());
        Arc::new(CertManager::new(store, policy, authority, settings))
    }

    async fn seed(dir: &TempDir, host: &str, days: i64) -> CertificateRecord {
        let issued = MockAuthority::self_signed(host, days).unwrap();
        let record = CertificateRecord::new(host, issued.key_pem, issued.chain_pem).unwrap();
        DirStore::new(dir.path()).unwrap().put(&record).await.unwrap();
        record
    }

    async fn wait_while_renewing(manager: &CertManager, host: &str) {
        for _ in 0..200 {
            if manager.state(host).await != CertState::Renewing {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("renewal of {host} did not finish");
    }

    #[tokio::test]
    async fn test_denied_host_makes_no_authority_call() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(DirStore::new(dir.path()).unwrap());
        let policy = Arc::new(AllowList::new(["example.com"]).unwrap());
        let manager = Arc::new(
            CertManager::new(store, policy, authority.clone(), fast_settings())
                .with_notifier(notifier.clone()),
        );

        for host in ["evil.com", "sub.example.com", "../etc"] {
            let result = manager.certificate_for(Some(host)).await;
            assert!(matches!(result, Err(ProxyError::PolicyDenied(_))));
        }

        assert_eq!(authority.calls(), 0);
        assert_eq!(
            *notifier.hosts.lock().unwrap(),
            vec!["evil.com", "sub.example.com", "../etc"]
        );
    }

    #[tokio::test]
    async fn test_missing_server_name_rejected() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new());
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        assert!(manager.certificate_for(None).await.is_err());
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_acquire_once() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new().with_delay(Duration::from_millis(200)));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.certificate_for(Some("example.com")).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state("example.com").await, CertState::Pending);

        let mut records = Vec::new();
        for handle in handles {
            records.push(handle.await.unwrap().unwrap().record.clone());
        }

        assert_eq!(authority.calls(), 1);
        assert!(records.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(manager.state("example.com").await, CertState::Valid);
    }

    #[tokio::test]
    async fn test_cached_certificate_skips_acquisition() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new());
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let first = manager.certificate_for(Some("example.com")).await.unwrap();
        let second = manager.certificate_for(Some("EXAMPLE.com.")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_certificate_survives_restart() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new());
        let first = manager_with(&dir, authority.clone(), fast_settings());
        let issued = first.certificate_for(Some("example.com")).await.unwrap();

        let restarted_authority = Arc::new(MockAuthority::new());
        let restarted = manager_with(&dir, restarted_authority.clone(), fast_settings());
        assert_eq!(restarted.preload().await, 1);

        let loaded = restarted.certificate_for(Some("example.com")).await.unwrap();
        assert_eq!(loaded.record, issued.record);
        assert_eq!(restarted_authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_renewal_serves_stale_certificate_then_replaces_it() {
        let dir = TempDir::new().unwrap();
        let stale = seed(&dir, "example.com", 10).await;
        let authority = Arc::new(MockAuthority::new().with_delay(Duration::from_millis(100)));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let served = manager.certificate_for(Some("example.com")).await.unwrap();
        assert_eq!(served.record, stale);
        assert_eq!(manager.state("example.com").await, CertState::Renewing);

        // Handshakes during renewal keep getting the old certificate
        let during = manager.certificate_for(Some("example.com")).await.unwrap();
        assert_eq!(during.record, stale);

        wait_while_renewing(&manager, "example.com").await;

        let renewed = manager.certificate_for(Some("example.com")).await.unwrap();
        assert_ne!(renewed.record, stale);
        assert!(renewed.record.expires_at > stale.expires_at);
        assert_eq!(authority.calls(), 1);
        assert_eq!(manager.state("example.com").await, CertState::Valid);

        let stored = DirStore::new(dir.path()).unwrap().get("example.com").await.unwrap();
        assert_eq!(stored.unwrap(), renewed.record);
    }

    #[tokio::test]
    async fn test_renewal_retries_transient_failures() {
        let dir = TempDir::new().unwrap();
        let stale = seed(&dir, "example.com", 10).await;
        let authority = Arc::new(MockAuthority::new().with_failures(vec![
            ProxyError::AcquisitionTransient("rate limited".into()),
            ProxyError::AcquisitionTransient("rate limited".into()),
            ProxyError::AcquisitionTransient("rate limited".into()),
            ProxyError::AcquisitionTransient("rate limited".into()),
        ]));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let served = manager.certificate_for(Some("example.com")).await.unwrap();
        assert_eq!(served.record, stale);

        wait_while_renewing(&manager, "example.com").await;
        assert_eq!(authority.calls(), 5);
        let renewed = manager.certificate_for(Some("example.com")).await.unwrap();
        assert_ne!(renewed.record, stale);
    }

    #[tokio::test]
    async fn test_short_lived_certificate_is_not_renewed_every_handshake() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new().with_validity_days(7));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        for _ in 0..5 {
            assert!(manager.certificate_for(Some("example.com")).await.is_ok());
            wait_while_renewing(&manager, "example.com").await;
        }

        assert_eq!(authority.calls(), 1);
        assert_eq!(manager.state("example.com").await, CertState::Valid);
    }

    #[tokio::test]
    async fn test_short_lived_renewal_happens_once() {
        let dir = TempDir::new().unwrap();
        let stale = seed(&dir, "example.com", 3).await;
        let authority = Arc::new(MockAuthority::new().with_validity_days(7));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let served = manager.certificate_for(Some("example.com")).await.unwrap();
        assert_eq!(served.record, stale);
        wait_while_renewing(&manager, "example.com").await;
        assert_eq!(authority.calls(), 1);

        for _ in 0..3 {
            let cert = manager.certificate_for(Some("example.com")).await.unwrap();
            assert_ne!(cert.record, stale);
            wait_while_renewing(&manager, "example.com").await;
        }
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_certificate_fails_until_renewed() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new().with_delay(Duration::from_millis(50)));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let issued = MockAuthority::self_signed("example.com", -2).unwrap();
        let record = CertificateRecord::new("example.com", issued.key_pem, issued.chain_pem).unwrap();
        manager
            .cache_insert(Arc::new(ManagedCertificate::from_record(record).unwrap()))
            .await;
        assert_eq!(manager.state("example.com").await, CertState::Expired);

        let result = manager.certificate_for(Some("example.com")).await;
        assert!(matches!(result, Err(ProxyError::Tls(_))));

        for _ in 0..200 {
            if manager.state("example.com").await == CertState::Valid {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.certificate_for(Some("example.com")).await.is_ok());
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_store_record_is_replaced_on_demand() {
        let dir = TempDir::new().unwrap();
        let expired = seed(&dir, "example.com", -2).await;
        let authority = Arc::new(MockAuthority::new());
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let cert = manager.certificate_for(Some("example.com")).await.unwrap();
        assert_ne!(cert.record, expired);
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new().with_failures(vec![
            ProxyError::AcquisitionTransient("unreachable".into()),
            ProxyError::AcquisitionTransient("unreachable".into()),
        ]));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        assert!(manager.certificate_for(Some("example.com")).await.is_ok());
        assert_eq!(authority.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_bounded() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(MockAuthority::new().with_failures(vec![
            ProxyError::AcquisitionTransient("unreachable".into()),
            ProxyError::AcquisitionTransient("unreachable".into()),
            ProxyError::AcquisitionTransient("unreachable".into()),
        ]));
        let manager = manager_with(&dir, authority.clone(), fast_settings());

        let result = manager.certificate_for(Some("example.com")).await;
        assert!(matches!(result, Err(ProxyError::AcquisitionTransient(_))));
        assert_eq!(authority.calls(), 3);
        assert_eq!(manager.state("example.com").await, CertState::Unknown);
    }

    #[tokio::test]
    async fn test_rejection_starts_cooldown() {
        let dir = TempDir::new().unwrap();
        let authority = Arc::new(
            MockAuthority::new()
                .with_failures(vec![ProxyError::AcquisitionFatal("domain does not resolve".into())]),
        );
        let settings = ManagerSettings {
            retry_max: Duration::from_secs(60),
            ..fast_settings()
        };
        let manager = manager_with(&dir, authority.clone(), settings);

        let first = manager.certificate_for(Some("example.com")).await;
        assert!(matches!(first, Err(ProxyError::AcquisitionFatal(_))));

        let second = manager.certificate_for(Some("example.com")).await;
        assert!(matches!(second, Err(ProxyError::AcquisitionFatal(_))));
        assert_eq!(authority.calls(), 1);

        // Other hosts are unaffected
        assert!(manager.certificate_for(Some("www.example.com")).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let authority = Arc::new(MockAuthority::new());
        let policy = Arc::new(AllowList::new(["example.com"]).unwrap());
        let manager = Arc::new(CertManager::new(
            Arc::new(FailingStore),
            policy,
            authority.clone(),
            fast_settings(),
        ));

        let result = manager.certificate_for(Some("example.com")).await;
        assert!(matches!(result, Err(ProxyError::Store(_))));
        assert_eq!(authority.calls(), 0);
    }
}
