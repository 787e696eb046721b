//! Reverse proxy forwarder
//!
//! Relays decrypted requests to the backend origin and streams the response
//! back. Bodies are never buffered; dropping the client side of a request
//! drops the backend request with it.

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CONNECTION, HOST, TE},
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Version,
    },
    response::{IntoResponse, Response},
    Router,
};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::error::{ProxyError, Result};
use crate::origin::BackendOrigin;

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

/// Headers that only apply to a single connection leg
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Address of the client that sent a request, set as a request extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Forwards requests to the backend origin
pub struct Forwarder {
    origin: BackendOrigin,
    host_header: HeaderValue,
    client: HttpClient,
    timeout: Duration,
}

impl Forwarder {
    /// Create a forwarder for `origin`.
    ///
    /// `timeout` bounds the wait for the backend's response headers.
    pub fn new(origin: BackendOrigin, connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let host_header = HeaderValue::from_str(origin.authority())
            .map_err(|e| ProxyError::Config(format!("Invalid backend host: {}", e)))?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.enforce_http(true);

        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        Ok(Self {
            origin,
            host_header,
            client,
            timeout,
        })
    }

    /// Backend this forwarder targets
    pub fn origin(&self) -> &BackendOrigin {
        &self.origin
    }

    /// Build the Axum router sending every request to the backend
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Forward one request and return the backend's response, or a
    /// gateway error
    pub async fn forward(&self, req: Request<Body>) -> Response {
        let client_ip = req.extensions().get::<ClientAddr>().map(|addr| addr.0.ip());
        let (mut parts, body) = req.into_parts();

        let original_host = parts.headers.get(HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

        parts.uri = match self.origin.rewrite_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(error = %e, "Cannot rewrite request URI");
                return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
            }
        };
        debug!(method = %parts.method, uri = %parts.uri, "Forwarding request");

        let wants_trailers = accepts_trailers(&parts.headers);
        strip_hop_by_hop(&mut parts.headers);
        if wants_trailers {
            parts.headers.insert(TE, HeaderValue::from_static("trailers"));
        }

        parts.version = Version::HTTP_11;
        parts.headers.insert(HOST, self.host_header.clone());
        append_forwarded_for(&mut parts.headers, client_ip);
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        if let Some(host) = original_host {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }

        let forward_req = Request::from_parts(parts, body);

        match self.send(forward_req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                match &e {
                    ProxyError::BackendTimeout(_) => {
                        warn!(backend = %self.origin.authority(), error = %e, "Backend timed out")
                    }
                    _ => error!(backend = %self.origin.authority(), error = %e, "Backend error"),
                }
                gateway_error(&e)
            }
        }
    }

    async fn send(&self, req: Request<Body>) -> Result<Response<Incoming>> {
        tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| ProxyError::BackendTimeout(self.timeout))?
            .map_err(|e| ProxyError::Backend(e.to_string()))
    }
}

/// Client-facing response for a failed forward. The body never carries
/// the underlying error.
fn gateway_error(err: &ProxyError) -> Response {
    match err {
        ProxyError::BackendTimeout(_) => {
            (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
        }
        _ => (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response(),
    }
}

/// Main proxy handler - forwards requests to the backend
async fn proxy_handler(State(forwarder): State<Arc<Forwarder>>, req: Request<Body>) -> Response {
    forwarder.forward(req).await
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn accepts_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("trailers"))
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: Option<std::net::IpAddr>) {
    let Some(ip) = client_ip else {
        return;
    };
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::any;
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    async fn echo(req: Request<Body>) -> axum::Json<serde_json::Value> {
        let headers: serde_json::Map<String, serde_json::Value> = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().into()))
            .collect();
        axum::Json(serde_json::json!({
            "uri": req.uri().to_string(),
            "headers": headers,
        }))
    }

    async fn spawn_backend(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn forwarder(addr: SocketAddr, timeout: Duration) -> Arc<Forwarder> {
        let origin = BackendOrigin::parse(&format!("http://{}", addr)).unwrap();
        Arc::new(Forwarder::new(origin, Duration::from_secs(2), timeout).unwrap())
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-request-id", HeaderValue::from_static("42"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers["x-request-id"], "42");
        assert_eq!(headers["content-type"], "text/plain");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        append_forwarded_for(&mut headers, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.1, 192.0.2.7");

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, None);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_accepts_trailers() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_trailers(&headers));
        headers.insert(TE, HeaderValue::from_static("gzip, Trailers"));
        assert!(accepts_trailers(&headers));
    }

    #[tokio::test]
    async fn test_gateway_error_hides_details() {
        let response = gateway_error(&ProxyError::Backend(
            "tcp connect error: 10.1.2.3:8080".to_string(),
        ));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_string(response).await, "Bad Gateway");

        let response = gateway_error(&ProxyError::BackendTimeout(Duration::from_secs(30)));
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_string(response).await, "Gateway Timeout");
    }

    #[tokio::test]
    async fn test_send_reports_backend_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Body::empty())
            .unwrap();
        let result = forwarder(addr, Duration::from_secs(5)).send(req).await;
        assert!(matches!(result, Err(ProxyError::Backend(_))));
    }

    #[tokio::test]
    async fn test_forward_rewrites_request() {
        let backend = spawn_backend(Router::new().fallback(echo)).await;
        let router = forwarder(backend, Duration::from_secs(5)).router();

        let mut req = Request::builder()
            .uri("/hello?x=1")
            .header(HOST, "example.com")
            .header(CONNECTION, "x-drop-me")
            .header("x-drop-me", "1")
            .header("x-keep-me", "1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ClientAddr("192.0.2.7:50000".parse().unwrap()));

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["uri"], "/hello?x=1");
        let headers = &json["headers"];
        assert_eq!(headers["host"], backend.to_string());
        assert_eq!(headers["x-forwarded-for"], "192.0.2.7");
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert_eq!(headers["x-forwarded-host"], "example.com");
        assert_eq!(headers["x-keep-me"], "1");
        assert!(headers.get("x-drop-me").is_none());
    }

    #[tokio::test]
    async fn test_forward_streams_request_body() {
        async fn upload(body: String) -> String {
            format!("got {} bytes", body.len())
        }
        let backend = spawn_backend(Router::new().route("/upload", any(upload))).await;
        let router = forwarder(backend, Duration::from_secs(5)).router();

        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(HOST, "example.com")
            .body(Body::from("x".repeat(100_000)))
            .unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(body_string(response).await, "got 100000 bytes");
    }

    #[tokio::test]
    async fn test_backend_down_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let router = forwarder(addr, Duration::from_secs(5)).router();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_string(response).await;
        assert_eq!(body, "Bad Gateway");
        assert!(!body.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_slow_backend_is_gateway_timeout() {
        async fn slow() -> &'static str {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }
        let backend = spawn_backend(Router::new().fallback(slow)).await;
        let router = forwarder(backend, Duration::from_millis(200)).router();

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = router.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_string(response).await, "Gateway Timeout");
    }
}
