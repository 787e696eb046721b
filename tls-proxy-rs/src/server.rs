//! Dual listener front-end
//!
//! - Port 80 answers HTTP-01 challenges and redirects everything else to
//!   the HTTPS equivalent URL.
//! - Port 443 terminates TLS with a certificate chosen per SNI hostname and
//!   hands the decrypted stream to the [`Forwarder`].
//!
//! Each accepted connection is served on its own task. Cancelling the
//! shutdown token stops both accept loops; in-flight connections then get
//! the configured grace period to finish.

use axum::{
    body::Body,
    http::{header, uri::Authority, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::authority::{AcmeAuthority, CertificateAuthority};
use crate::challenge::acme_challenge_handler;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::manager::CertManager;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::origin::BackendOrigin;
use crate::policy::AllowList;
use crate::proxy::{ClientAddr, Forwarder};
use crate::store::DirStore;
use crate::tls::{Accepted, TlsTerminator};

/// Bound sockets, created before serving so bind failures stop start-up
pub struct Listeners {
    http: TcpListener,
    https: TcpListener,
}

impl Listeners {
    /// Local address of the plain HTTP listener
    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http.local_addr()?)
    }

    /// Local address of the TLS listener
    pub fn https_addr(&self) -> Result<SocketAddr> {
        Ok(self.https.local_addr()?)
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    manager: Arc<CertManager>,
    forwarder: Arc<Forwarder>,
    terminator: TlsTerminator,
    connections: TaskTracker,
}

impl ProxyServer {
    /// Build a server talking to the configured ACME directory
    pub fn from_config(config: ProxyConfig) -> Result<Self> {
        let authority = Arc::new(AcmeAuthority::new(
            config.acme.directory.clone(),
            config.acme.email.clone(),
            config.acme.cert_dir.clone(),
            config.request_timeout(),
        ));
        Self::new(config, authority)
    }

    /// Build a server obtaining certificates from `authority`
    pub fn new(config: ProxyConfig, authority: Arc<dyn CertificateAuthority>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(DirStore::new(&config.acme.cert_dir)?);
        let policy = Arc::new(AllowList::new(&config.acme.allowed_hosts)?);
        let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
            None => Arc::new(LogNotifier),
        };

        let manager = Arc::new(
            CertManager::new(store, policy, authority, config.manager_settings())
                .with_notifier(notifier),
        );

        let origin = BackendOrigin::parse(&config.backend.url)?;
        let forwarder = Arc::new(Forwarder::new(
            origin,
            config.connect_timeout(),
            config.backend_timeout(),
        )?);

        let terminator = TlsTerminator::new(manager.clone(), config.handshake_timeout());

        Ok(Self {
            config,
            manager,
            forwarder,
            terminator,
            connections: TaskTracker::new(),
        })
    }

    /// Certificate lifecycle manager
    pub fn manager(&self) -> &Arc<CertManager> {
        &self.manager
    }

    /// TLS connections currently being served, handshakes included
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Bind both listeners
    pub async fn bind(&self) -> Result<Listeners> {
        let http = bind(&self.config.server.http_addr).await?;
        let https = bind(&self.config.server.https_addr).await?;
        Ok(Listeners { http, https })
    }

    /// Build the port-80 router: ACME challenges, otherwise redirect
    pub fn http_router(&self, https_port: u16) -> Router {
        let challenges = Router::new()
            .route("/.well-known/acme-challenge/:token", get(acme_challenge_handler))
            .with_state(self.manager.challenges().clone());

        Router::new()
            .merge(challenges)
            .fallback(move |req: Request<Body>| async move { https_redirect(&req, https_port) })
            .layer(TraceLayer::new_for_http())
    }

    /// Serve both listeners until `shutdown` is cancelled
    pub async fn serve(&self, listeners: Listeners, shutdown: CancellationToken) -> Result<()> {
        let http_addr = listeners.http_addr()?;
        let https_addr = listeners.https_addr()?;
        info!(
            http = %http_addr,
            https = %https_addr,
            backend = %self.forwarder.origin().authority(),
            "Starting proxy server"
        );

        let http_shutdown = shutdown.clone();
        let http_router = self.http_router(https_addr.port());
        let http = tokio::spawn(async move {
            axum::serve(listeners.http, http_router)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await
        });

        let force = CancellationToken::new();
        self.accept_loop(listeners.https, &shutdown, &force).await;

        info!(active = self.active_connections(), "Shutting down, draining connections");
        self.connections.close();
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, self.connections.wait()).await.is_err() {
            warn!(
                remaining = self.active_connections(),
                "Grace period elapsed, dropping connections"
            );
            force.cancel();
            self.connections.wait().await;
        }

        match tokio::time::timeout(grace, http).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "HTTP listener failed"),
            Ok(Err(e)) => error!(error = %e, "HTTP listener task failed"),
            Err(_) => warn!("HTTP listener did not stop within the grace period"),
        }

        info!("Proxy server stopped");
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        shutdown: &CancellationToken,
        force: &CancellationToken,
    ) {
        let router = self.forwarder.clone().router();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            self.connections.spawn(serve_connection(
                self.terminator.clone(),
                stream,
                peer,
                router.clone(),
                shutdown.clone(),
                force.clone(),
            ));
        }
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        ProxyError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to bind {}: {}", addr, e),
        ))
    })
}

async fn serve_connection(
    terminator: TlsTerminator,
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
    force: CancellationToken,
) {
    let accepted = tokio::select! {
        accepted = terminator.accept(stream) => accepted,
        _ = force.cancelled() => return,
    };
    let tls = match accepted {
        Ok(Accepted::Http(tls)) => tls,
        Ok(Accepted::Challenge) => return,
        Err(e) => {
            debug!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ClientAddr(peer));
        router.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => result,
                _ = force.cancelled() => {
                    debug!(peer = %peer, "Dropping connection");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Error serving connection");
    }
}

/// Permanent redirect to the HTTPS equivalent of `req`
fn https_redirect(req: &Request<Body>, https_port: u16) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(Authority::as_str))
        .and_then(|h| h.parse::<Authority>().ok());

    let Some(host) = host else {
        return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
    };

    let authority = if https_port == 443 {
        host.host().to_string()
    } else {
        format!("{}:{}", host.host(), https_port)
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, format!("https://{}{}", authority, path))],
    )
        .into_response()
}
