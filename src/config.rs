use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One record of the route file
///
/// Exactly one of `forward`/`serve` should be set. Records that set neither are
/// still accepted but produce a route that never matches.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct RouteConfig {
    /// Virtual host served by this route (also matches its subdomains)
    #[serde(default, alias = "Host")]
    pub host: String,

    /// Upstream address (host:port) to reverse-proxy to over plain HTTP
    #[serde(default, alias = "Forward")]
    pub forward: Option<String>,

    /// Local directory to serve files from
    #[serde(default, alias = "Serve")]
    pub serve: Option<String>,
}

impl RouteConfig {
    /// Create a proxy record
    pub fn forward(host: &str, upstream: &str) -> Self {
        Self {
            host: host.to_string(),
            forward: Some(upstream.to_string()),
            serve: None,
        }
    }

    /// Create a static directory record
    pub fn serve(host: &str, dir: &str) -> Self {
        Self {
            host: host.to_string(),
            forward: None,
            serve: Some(dir.to_string()),
        }
    }

    /// Upstream address, if set and non-empty
    pub fn forward_addr(&self) -> Option<&str> {
        self.forward.as_deref().filter(|s| !s.is_empty())
    }

    /// Static root, if set and non-empty
    pub fn serve_dir(&self) -> Option<&str> {
        self.serve.as_deref().filter(|s| !s.is_empty())
    }
}

/// TOML layout of the route file: a list of `[[route]]` tables
#[derive(Debug, Deserialize)]
struct TomlRouteFile {
    #[serde(default, alias = "routes")]
    route: Vec<RouteConfig>,
}

/// Decode route records from the file contents.
///
/// Files ending in `.toml` are read as `[[route]]` tables, everything else as a
/// JSON array.
pub fn parse_routes(path: &Path, content: &str) -> Result<Vec<RouteConfig>, String> {
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    if is_toml {
        toml::from_str::<TomlRouteFile>(content)
            .map(|file| file.route)
            .map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<Vec<RouteConfig>>(content).map_err(|e| e.to_string())
    }
}

/// How the HTTPS listener gets its certificates
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TlsMode {
    /// HTTPS disabled
    #[default]
    Disabled,
    /// Generated self-signed certificate for localhost (development only)
    SelfSigned,
    /// Per-host PEM pairs read from a directory
    CertDir(PathBuf),
}

/// Process-level settings for the gateway
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Route file watched by the reloader
    pub routes_path: PathBuf,

    /// Plain HTTP listen address (default: 0.0.0.0:80)
    pub http_addr: String,

    /// HTTPS listen address, used when TLS is enabled (default: 0.0.0.0:443)
    pub https_addr: String,

    /// Interval between route file checks (default: 10s)
    pub poll_interval: Duration,

    /// TLS certificate source
    pub tls: TlsMode,

    /// Maximum idle upstream connections per host (default: 10)
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout (default: 90s)
    pub pool_idle_timeout: Duration,

    /// Append log output to this file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(routes_path: impl Into<PathBuf>) -> Self {
        Self {
            routes_path: routes_path.into(),
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            poll_interval: default_poll_interval(),
            tls: TlsMode::default(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout: default_pool_idle_timeout(),
            log_file: None,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls != TlsMode::Disabled
    }
}

pub fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

pub fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

pub fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(90)
}
