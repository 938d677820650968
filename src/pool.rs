//! Pooled HTTP client for proxy routes
//!
//! Requests are forwarded over plain HTTP to the route's upstream authority
//! and the upstream response is streamed back without buffering.

use crate::error::ProxyBody;
use http::uri::{Authority, Scheme};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Headers that only apply to a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client (connect, write or read failure)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The upstream URI could not be assembled
    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUriParts),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to upstream servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client }
    }

    /// Forward a request to `upstream` and return its response as-is
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        upstream: &Authority,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let response = self.send(req, upstream, None).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.map_err(Into::into).boxed()))
    }

    /// Forward a protocol upgrade request (WebSocket and the like).
    ///
    /// `Connection`/`Upgrade` survive so the upstream can switch protocols. The
    /// raw response is returned so the caller can take over both connections.
    pub async fn send_upgrade(
        &self,
        req: Request<Incoming>,
        upstream: &Authority,
    ) -> Result<Response<Incoming>, PoolError> {
        let protocol = req.headers().get(hyper::header::UPGRADE).cloned();
        self.send(req, upstream, protocol).await
    }

    async fn send(
        &self,
        req: Request<Incoming>,
        upstream: &Authority,
        upgrade: Option<HeaderValue>,
    ) -> Result<Response<Incoming>, PoolError> {
        let (mut parts, body) = req.into_parts();

        parts.uri = upstream_uri(&parts.uri, upstream)?;
        // The client speaks HTTP/1.1 to upstreams regardless of the inbound version
        parts.version = hyper::Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = upgrade {
            parts
                .headers
                .insert(hyper::header::CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(hyper::header::UPGRADE, protocol);
        }

        Ok(self.client.request(Request::from_parts(parts, body)).await?)
    }
}

/// Rewrite `uri` to `http://{upstream}{path_and_query}`
pub fn upstream_uri(uri: &Uri, upstream: &Authority) -> Result<Uri, PoolError> {
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority = Some(upstream.clone());
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    Ok(Uri::from_parts(parts)?)
}

/// Remove hop-by-hop headers, including any listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
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
