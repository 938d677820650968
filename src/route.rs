//! Routes: one virtual host mapped to one backend

use crate::config::RouteConfig;
use http::uri::Authority;
use std::path::PathBuf;
use std::str::FromStr;

/// What a matched request is handed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Reverse-proxy to this upstream over plain HTTP
    Proxy(Authority),
    /// Serve files below this directory
    StaticDir(PathBuf),
    /// Record named no usable backend; matching requests get a 404
    Invalid,
}

impl Backend {
    /// Build the backend for a record.
    ///
    /// `forward` takes precedence over `serve`. An empty record, or a `forward`
    /// value that is not a valid `host:port` authority, gives `Invalid`.
    pub fn from_config(config: &RouteConfig) -> Self {
        if let Some(addr) = config.forward_addr() {
            return match Authority::from_str(addr) {
                Ok(authority) => Backend::Proxy(authority),
                Err(_) => Backend::Invalid,
            };
        }

        if let Some(dir) = config.serve_dir() {
            return Backend::StaticDir(PathBuf::from(dir));
        }

        Backend::Invalid
    }

    /// Short name used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Proxy(_) => "proxy",
            Backend::StaticDir(_) => "static",
            Backend::Invalid => "invalid",
        }
    }
}

/// A host pattern and its backend. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    host: String,
    backend: Backend,
}

impl Route {
    pub fn new(host: &str, backend: Backend) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            backend,
        }
    }

    pub fn from_config(config: &RouteConfig) -> Self {
        Self::new(&config.host, Backend::from_config(config))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Whether requests matching this route can be served at all
    pub fn is_routable(&self) -> bool {
        self.backend != Backend::Invalid
    }

    /// True if `hostname` is this route's host or one of its subdomains.
    ///
    /// `hostname` must already be lower-cased and stripped of any port.
    pub fn matches(&self, hostname: &str) -> bool {
        match hostname.strip_suffix(self.host.as_str()) {
            Some("") => true,
            Some(prefix) => prefix.ends_with('.'),
            None => false,
        }
    }
}
