use crate::error::{error_response, ProxyBody, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::route::Backend;
use crate::static_files;
use crate::table::{RoutingTable, SharedTable};
use http::uri::Authority;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Longest name DNS allows
const MAX_HOSTNAME_LEN: usize = 253;

/// Accepts connections on one listener and dispatches by Host header
pub struct ProxyServer {
    listener: TcpListener,
    table: SharedTable,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        listener: TcpListener,
        table: SharedTable,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            table,
            pool,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %addr, protocol, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let table = Arc::clone(&self.table);
                            let pool = Arc::clone(&self.pool);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, table, pool, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, table, pool, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!(addr = %addr, protocol, "Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    table: SharedTable,
    pool: Arc<ConnectionPool>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let table = Arc::clone(&table);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, table, pool, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    table: SharedTable,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    // One snapshot for the whole request, even if a reload lands meanwhile
    let snapshot = table.current();
    let response = dispatch(req, &snapshot, &pool, client_addr, is_tls).await;

    debug!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request handled"
    );

    Ok(response)
}

/// Route `req` through `table` and hand it to the matched backend
pub async fn dispatch(
    req: Request<Incoming>,
    table: &RoutingTable,
    pool: &ConnectionPool,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Response<ProxyBody> {
    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => return error_response(ProxyErrorCode::UnknownHost),
    };

    match table.lookup(&hostname) {
        Some(Backend::Proxy(upstream)) => forward(req, upstream, pool, client_addr, is_tls).await,
        Some(Backend::StaticDir(root)) => static_files::serve(&req, root).await,
        Some(Backend::Invalid) | None => {
            debug!(hostname, "No route for host");
            error_response(ProxyErrorCode::UnknownHost)
        }
    }
}

async fn forward(
    mut req: Request<Incoming>,
    upstream: &Authority,
    pool: &ConnectionPool,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Response<ProxyBody> {
    // The host that was routed on is the Host upstreams see (HTTP/2 and
    // absolute-form requests carry it in the URI)
    if let Some(value) = req
        .uri()
        .authority()
        .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    {
        req.headers_mut().insert(hyper::header::HOST, value);
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Security: We overwrite X-Forwarded-* headers rather than appending to prevent
    // client spoofing. This gateway is assumed to be the first trusted hop.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if is_upgrade_request(&req) {
        return forward_upgrade(req, upstream, pool, request_id).await;
    }

    match pool.send_request(req, upstream).await {
        Ok(response) => response,
        Err(e) => {
            error!(upstream = %upstream, request_id, error = %e, "Failed to forward request");
            error_response(ProxyErrorCode::UpstreamUnreachable)
        }
    }
}

/// Check if a request asks to switch protocols (WebSocket and the like)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

async fn forward_upgrade(
    mut req: Request<Incoming>,
    upstream: &Authority,
    pool: &ConnectionPool,
    request_id: String,
) -> Response<ProxyBody> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut response = match pool.send_upgrade(req, upstream).await {
        Ok(response) => response,
        Err(e) => {
            error!(upstream = %upstream, request_id, error = %e, "Failed to forward upgrade request");
            return error_response(ProxyErrorCode::UpstreamUnreachable);
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(upstream = %upstream, status = %response.status(), "Upstream declined upgrade");
        return response.map(|body| body.map_err(Into::into).boxed());
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let upstream_name = upstream.to_string();

    tokio::spawn(async move {
        let (client, server) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(upstream = %upstream_name, request_id, error = %e, "Upgrade handshake failed");
                return;
            }
        };

        let mut client_io = TokioIo::new(client);
        let mut server_io = TokioIo::new(server);
        match tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await {
            Ok((client_to_upstream, upstream_to_client)) => {
                debug!(
                    upstream = %upstream_name,
                    request_id,
                    client_to_upstream,
                    upstream_to_client,
                    "Upgraded connection closed"
                );
            }
            Err(e) => {
                debug!(upstream = %upstream_name, request_id, error = %e, "Upgraded connection closed with error");
            }
        }
    });

    response.map(|body| body.map_err(Into::into).boxed())
}

/// Host the request is addressed to, lower-cased and without port.
///
/// The URI authority wins when present (absolute-form request line, HTTP/2
/// `:authority`), otherwise the Host header is used. Returns `None` when there
/// is no host or it contains characters no DNS name has.
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.uri().authority() {
        Some(authority) => authority.host(),
        None => req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())?,
    };

    // Strip port if present
    let hostname = raw.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, underscore and dot only; keeps log fields clean
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}
