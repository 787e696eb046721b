//! Certificate authority clients
//!
//! [`CertificateAuthority`] is the seam between the lifecycle manager and
//! whatever issues certificates. [`AcmeAuthority`] talks ACME to Let's
//! Encrypt (or any RFC 8555 directory); [`MockAuthority`] issues
//! self-signed certificates locally and records how often it was asked.
//!
//! # Challenge Flow
//!
//! 1. Create/load the account (credentials cached in the cert directory)
//! 2. Create a new order for the hostname
//! 3. Pick TLS-ALPN-01 if offered, otherwise HTTP-01, and register the
//!    response with the [`ChallengeResponder`]
//! 4. Tell the server the challenge is ready and poll the order
//! 5. Finalize with a fresh key's CSR and download the chain

use chrono::{Datelike, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::challenge::ChallengeResponder;
use crate::error::{ProxyError, Result};
use crate::store::write_atomic;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Account credentials file inside the certificate cache directory
pub const ACCOUNT_FILE: &str = "acme_account.json";

// ACME problem types worth retrying
const TRANSIENT_PROBLEMS: [&str; 3] = [":rateLimited", ":serverInternal", ":badNonce"];

const ORDER_POLL_ATTEMPTS: u32 = 10;

/// Key and chain returned by a certificate authority
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded private key
    pub key_pem: String,
    /// PEM-encoded certificate chain, leaf first
    pub chain_pem: String,
}

/// Something that can issue a certificate for a hostname
#[async_trait::async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Obtain a certificate for `hostname`, answering validation through `challenges`
    async fn issue(
        &self,
        hostname: &str,
        challenges: &ChallengeResponder,
    ) -> Result<IssuedCertificate>;
}

enum PendingChallenge {
    Http(String),
    Alpn(String),
}

/// ACME certificate authority client
pub struct AcmeAuthority {
    /// ACME directory URL
    directory_url: String,
    /// Contact email
    email: Option<String>,
    /// Where account credentials are persisted
    account_path: PathBuf,
    /// Bound on a single order, from account lookup to certificate download
    request_timeout: Duration,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    /// Create a new ACME client; the account is created lazily on first use
    pub fn new(
        directory_url: String,
        email: Option<String>,
        cert_dir: PathBuf,
        request_timeout: Duration,
    ) -> Self {
        Self {
            directory_url,
            email,
            account_path: cert_dir.join(ACCOUNT_FILE),
            request_timeout,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                if let Some(account) = self.load_account().await? {
                    return Ok(account);
                }
                self.create_account().await
            })
            .await
    }

    async fn load_account(&self) -> Result<Option<Account>> {
        let json = match tokio::fs::read_to_string(&self.account_path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::Store(format!(
                    "Failed to read ACME account: {}",
                    e
                )))
            }
        };

        let credentials: AccountCredentials = match serde_json::from_str(&json) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Stored ACME account is unreadable, creating a new one");
                return Ok(None);
            }
        };

        let account = Account::from_credentials(credentials)
            .await
            .map_err(acme_error)?;
        debug!("Loaded existing ACME account");
        Ok(Some(account))
    }

    async fn create_account(&self) -> Result<Account> {
        let contact: Vec<String> = self
            .email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        info!(directory = %self.directory_url, "Creating ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(acme_error)?;

        let json = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| ProxyError::Store(format!("Failed to serialize ACME account: {}", e)))?;
        write_atomic(&self.account_path, json).await?;

        Ok(account)
    }

    async fn complete_order(
        &self,
        order: &mut Order,
        hostname: &str,
        challenges: &ChallengeResponder,
        pending: &mut Vec<PendingChallenge>,
    ) -> Result<IssuedCertificate> {
        let authorizations = order.authorizations().await.map_err(acme_error)?;

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(ProxyError::AcquisitionFatal(format!(
                        "Authorization for {} is {:?}",
                        hostname, status
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .or_else(|| {
                    authz
                        .challenges
                        .iter()
                        .find(|c| c.r#type == ChallengeType::Http01)
                })
                .ok_or_else(|| {
                    ProxyError::AcquisitionFatal(format!(
                        "No supported challenge offered for {}",
                        hostname
                    ))
                })?;

            let key_authorization = order.key_authorization(challenge);
            if challenge.r#type == ChallengeType::TlsAlpn01 {
                challenges
                    .add_alpn_certificate(hostname, key_authorization.digest().as_ref())
                    .await?;
                pending.push(PendingChallenge::Alpn(hostname.to_string()));
            } else {
                challenges
                    .add_http_token(&challenge.token, key_authorization.as_str())
                    .await;
                pending.push(PendingChallenge::Http(challenge.token.clone()));
            }

            debug!(host = %hostname, challenge = ?challenge.r#type, "Challenge ready");
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(acme_error)?;
        }

        // Wait for the order to become ready
        let mut delay = Duration::from_millis(250);
        let mut tries = 0;
        loop {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await.map_err(acme_error)?;

            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    return Err(ProxyError::AcquisitionFatal(format!(
                        "Validation failed for {}",
                        hostname
                    )))
                }
                OrderStatus::Valid => {
                    return Err(ProxyError::AcquisitionTransient(format!(
                        "Order for {} was already finalized",
                        hostname
                    )))
                }
                _ => {}
            }

            tries += 1;
            if tries >= ORDER_POLL_ATTEMPTS {
                return Err(ProxyError::AcquisitionTransient(format!(
                    "Order for {} not ready after {} polls",
                    hostname, tries
                )));
            }
            delay = (delay * 2).min(Duration::from_secs(10));
        }

        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| ProxyError::Tls(format!("Failed to generate key: {}", e)))?;
        let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()])
            .map_err(|e| ProxyError::Tls(format!("Invalid hostname for CSR: {}", e)))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| ProxyError::Tls(format!("Failed to build CSR: {}", e)))?;

        order.finalize(csr.der()).await.map_err(acme_error)?;

        let mut tries = 0;
        let chain_pem = loop {
            if let Some(chain) = order.certificate().await.map_err(acme_error)? {
                break chain;
            }
            tries += 1;
            if tries >= ORDER_POLL_ATTEMPTS {
                return Err(ProxyError::AcquisitionTransient(format!(
                    "Certificate for {} not available after finalization",
                    hostname
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        Ok(IssuedCertificate {
            key_pem: key_pair.serialize_pem(),
            chain_pem,
        })
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn issue(
        &self,
        hostname: &str,
        challenges: &ChallengeResponder,
    ) -> Result<IssuedCertificate> {
        info!(host = %hostname, directory = %self.directory_url, "Requesting certificate");

        let mut pending = Vec::new();
        let attempt = async {
            let account = self.account().await?;
            let mut order = account
                .new_order(&NewOrder {
                    identifiers: &[Identifier::Dns(hostname.to_string())],
                })
                .await
                .map_err(acme_error)?;
            self.complete_order(&mut order, hostname, challenges, &mut pending)
                .await
        };

        let result = match tokio::time::timeout(self.request_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::AcquisitionTransient(format!(
                "ACME order for {} timed out",
                hostname
            ))),
        };

        for challenge in pending {
            match challenge {
                PendingChallenge::Http(token) => challenges.remove_http_token(&token).await,
                PendingChallenge::Alpn(host) => challenges.remove_alpn_certificate(&host).await,
            }
        }

        result
    }
}

fn acme_error(e: instant_acme::Error) -> ProxyError {
    match &e {
        instant_acme::Error::Api(problem) => {
            let kind = problem.r#type.as_deref().unwrap_or_default();
            if TRANSIENT_PROBLEMS.iter().any(|t| kind.ends_with(t)) {
                ProxyError::AcquisitionTransient(e.to_string())
            } else {
                ProxyError::AcquisitionFatal(e.to_string())
            }
        }
        _ => ProxyError::AcquisitionTransient(e.to_string()),
    }
}

/// Local certificate authority issuing self-signed certificates.
///
/// Counts invocations, can be slowed down and can be scripted to fail, so
/// tests can observe exactly what the lifecycle manager asks for.
pub struct MockAuthority {
    calls: AtomicUsize,
    delay: Duration,
    validity_days: i64,
    failures: Mutex<VecDeque<ProxyError>>,
}

impl MockAuthority {
    /// Issue 90-day certificates immediately
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            validity_days: 90,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Sleep this long inside every `issue` call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Validity of issued certificates
    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    /// Fail the next calls with these errors, in order
    pub fn with_failures(self, failures: Vec<ProxyError>) -> Self {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = failures.into();
        self
    }

    /// Number of `issue` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Self-signed certificate for `host` expiring `validity_days` from today
    pub fn self_signed(host: &str, validity_days: i64) -> Result<IssuedCertificate> {
        let expires = Utc::now() + chrono::Duration::days(validity_days);

        let mut params = rcgen::CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ProxyError::Tls(format!("Invalid hostname: {}", e)))?;
        params.not_after =
            rcgen::date_time_ymd(expires.year(), expires.month() as u8, expires.day() as u8);

        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| ProxyError::Tls(format!("Failed to generate key: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::Tls(format!("Failed to generate certificate: {}", e)))?;

        Ok(IssuedCertificate {
            key_pem: key_pair.serialize_pem(),
            chain_pem: cert.pem(),
        })
    }
}

impl Default for MockAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for MockAuthority {
    async fn issue(
        &self,
        hostname: &str,
        _challenges: &ChallengeResponder,
    ) -> Result<IssuedCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(host = %hostname, "MockAuthority: issuing certificate");

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(e) = failure {
            return Err(e);
        }

        Self::self_signed(hostname, self.validity_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::leaf_expiry;

    #[tokio::test]
    async fn test_mock_authority_counts_calls() {
        let authority = MockAuthority::new();
        let challenges = ChallengeResponder::new();

        let issued = authority.issue("example.com", &challenges).await.unwrap();
        assert!(issued.chain_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_authority_scripted_failures() {
        let authority = MockAuthority::new().with_failures(vec![
            ProxyError::AcquisitionTransient("busy".into()),
            ProxyError::AcquisitionFatal("no".into()),
        ]);
        let challenges = ChallengeResponder::new();

        assert!(matches!(
            authority.issue("example.com", &challenges).await,
            Err(ProxyError::AcquisitionTransient(_))
        ));
        assert!(matches!(
            authority.issue("example.com", &challenges).await,
            Err(ProxyError::AcquisitionFatal(_))
        ));
        assert!(authority.issue("example.com", &challenges).await.is_ok());
        assert_eq!(authority.calls(), 3);
    }

    #[test]
    fn test_self_signed_validity() {
        let issued = MockAuthority::self_signed("example.com", 10).unwrap();
        let expires = leaf_expiry(&issued.chain_pem).unwrap();
        let days = (expires - Utc::now()).num_days();
        assert!((8..=10).contains(&days), "unexpected validity {days}");
    }

    #[test]
    fn test_account_path() {
        let authority = AcmeAuthority::new(
            LETS_ENCRYPT_STAGING.to_string(),
            Some("admin@example.com".to_string()),
            PathBuf::from("/var/lib/tls-proxy-rs"),
            Duration::from_secs(60),
        );
        assert_eq!(
            authority.account_path,
            PathBuf::from("/var/lib/tls-proxy-rs/acme_account.json")
        );
    }
}
