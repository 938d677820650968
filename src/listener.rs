//! Listening sockets: bound fresh, or adopted from a supervising process
//!
//! A supervisor doing zero-downtime restarts passes already-listening sockets
//! down as file descriptors and names them in `RUNSIT_PORTFD_<name>`. When such
//! a descriptor is present it is used instead of binding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use tokio::net::TcpListener;
use tracing::info;

/// Environment variable naming the inherited plain HTTP socket
pub const HTTP_FD_ENV: &str = "RUNSIT_PORTFD_http";
/// Environment variable naming the inherited HTTPS socket
pub const HTTPS_FD_ENV: &str = "RUNSIT_PORTFD_https";

/// Error type for listener operations
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The configured address could not be understood
    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    /// Failed to bind to address
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// Failed to take over an inherited descriptor
    #[error("failed to adopt inherited socket fd {fd}: {source}")]
    Inherited {
        fd: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Parse a listen address.
///
/// Besides plain `ip:port`, accepts an empty host (`:8080`, all interfaces),
/// the service names `http`/`https` as ports and resolvable host names.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ListenerError> {
    let invalid = |reason: &str| ListenerError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;

    let port = match port {
        "http" => 80,
        "https" => 443,
        p => p.parse::<u16>().map_err(|_| invalid("bad port"))?,
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(&e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host resolved to no addresses"))
}

/// Read an inherited descriptor number from `var`.
///
/// Values below 3 (stdin/stdout/stderr, or unset) mean "bind yourself".
pub fn inherited_fd(var: &str) -> Option<i32> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .filter(|fd| *fd >= 3)
}

/// Get a listener for `addr`, preferring the inherited descriptor `fd`
pub async fn acquire(fd: Option<i32>, addr: &str) -> Result<TcpListener, ListenerError> {
    if let Some(fd) = fd {
        let listener = from_fd(fd)?;
        info!(fd, addr = ?listener.local_addr().ok(), "Using inherited listener");
        return Ok(listener);
    }

    let addr = parse_listen_addr(addr)?;
    TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind { addr, source })
}

#[cfg(unix)]
fn from_fd(fd: i32) -> Result<TcpListener, ListenerError> {
    use std::os::unix::io::FromRawFd;

    // Safety: the supervisor hands this descriptor to us as an open listening
    // socket and nothing else in the process owns it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .and_then(|_| TcpListener::from_std(std_listener))
        .map_err(|source| ListenerError::Inherited { fd, source })
}

#[cfg(not(unix))]
fn from_fd(fd: i32) -> Result<TcpListener, ListenerError> {
    Err(ListenerError::Inherited {
        fd,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "inherited sockets are only supported on Unix",
        ),
    })
}
