//! Backend origin
//!
//! The single plain-HTTP service every request is forwarded to. A path in
//! the backend URL acts as a prefix joined in front of each request path.

use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::Uri;
use url::Url;

use crate::error::{ProxyError, Result};

/// Parsed backend URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOrigin {
    authority: Authority,
    path_prefix: String,
}

impl BackendOrigin {
    /// Parse and validate a backend URL such as `http://127.0.0.1:8080`
    pub fn parse(backend: &str) -> Result<Self> {
        let url = Url::parse(backend)
            .map_err(|e| ProxyError::Config(format!("Invalid backend URL '{}': {}", backend, e)))?;

        if url.scheme() != "http" {
            return Err(ProxyError::Config(format!(
                "Backend URL '{}' must use http",
                backend
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("Backend URL '{}' has no host", backend)))?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ProxyError::Config(format!(
                "Backend URL '{}' must not carry credentials",
                backend
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(ProxyError::Config(format!(
                "Backend URL '{}' must not have a query or fragment",
                backend
            )));
        }

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let authority = authority
            .parse::<Authority>()
            .map_err(|e| ProxyError::Config(format!("Invalid backend authority: {}", e)))?;

        Ok(Self {
            authority,
            path_prefix: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// `host[:port]` of the backend, also used as the forwarded `Host` header
    pub fn authority(&self) -> &str {
        self.authority.as_str()
    }

    /// Path prefix from the backend URL, without trailing slash
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Rewrite a client request URI to target the backend.
    ///
    /// Without a prefix the path is kept as sent. With one, the path is
    /// joined onto it with a single slash between them. The query string is
    /// kept verbatim.
    pub fn rewrite_uri(&self, uri: &Uri) -> Result<Uri> {
        let path = join_path(&self.path_prefix, uri.path());
        let path_and_query = match uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        let path_and_query = path_and_query
            .parse::<PathAndQuery>()
            .map_err(|e| ProxyError::Http(format!("Invalid request path: {}", e)))?;

        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::Http(format!("Failed to build backend URI: {}", e)))
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        return if path.is_empty() { "/".to_string() } else { path.to_string() };
    }
    // At most one slash between prefix and path; the rest is relayed as sent
    let path = path.strip_prefix('/').unwrap_or(path);
    format!("{}/{}", prefix, path)
}
