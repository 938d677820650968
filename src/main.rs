use clap::Parser;
use hostgate::config::{ServerConfig, TlsMode};
use hostgate::listener::{acquire, inherited_fd, HTTPS_FD_ENV, HTTP_FD_ENV};
use hostgate::pool::{ConnectionPool, PoolConfig};
use hostgate::proxy::ProxyServer;
use hostgate::reloader::Reloader;
use hostgate::table::TableHolder;
use hostgate::tls::{self, SniCertResolver};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host-based HTTP gateway: reverse proxy and static file server
#[derive(Debug, Parser)]
#[command(name = "hostgate", version, about)]
struct Cli {
    /// Route file (JSON array, or `[[route]]` tables when it ends in .toml)
    #[arg(long, value_name = "PATH")]
    conf: PathBuf,

    /// Plain HTTP listen address
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:80")]
    http: String,

    /// HTTPS listen address, used when TLS is enabled
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:443")]
    https: String,

    /// Directory of <host>.crt/<host>.key pairs; enables HTTPS
    #[arg(long, value_name = "DIR", conflicts_with = "self_signed")]
    cert_dir: Option<PathBuf>,

    /// Enable HTTPS with a generated certificate for localhost
    #[arg(long)]
    self_signed: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// How often to check the route file for changes
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    poll: Duration,

    /// Maximum idle upstream connections kept per host
    #[arg(long, default_value_t = 10)]
    pool_max_idle: usize,

    /// How long idle upstream connections are kept
    #[arg(long, value_parser = humantime::parse_duration, default_value = "90s")]
    pool_idle_timeout: Duration,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let tls = if let Some(dir) = self.cert_dir {
            TlsMode::CertDir(dir)
        } else if self.self_signed {
            TlsMode::SelfSigned
        } else {
            TlsMode::Disabled
        };

        let mut config = ServerConfig::new(self.conf);
        config.http_addr = self.http;
        config.https_addr = self.https;
        config.poll_interval = self.poll;
        config.tls = tls;
        config.pool_max_idle_per_host = self.pool_max_idle;
        config.pool_idle_timeout = self.pool_idle_timeout;
        config.log_file = self.log;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config();

    init_logging(&config)?;
    print_startup_banner(&config);

    // Nothing to serve without a first table
    let table = TableHolder::load(&config.routes_path).map_err(|e| {
        error!(path = %config.routes_path.display(), error = %e, "Failed to load routes");
        e
    })?;
    {
        let current = table.current();
        info!(
            path = %config.routes_path.display(),
            routes = current.len(),
            routable = current.routable_count(),
            "Routes loaded"
        );
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reloader = Reloader::new(&config.routes_path, config.poll_interval, Arc::clone(&table));
    let reload_trigger = reloader.trigger();
    let reloader_handle = tokio::spawn(reloader.run(shutdown_rx.clone()));

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.pool_max_idle_per_host,
        idle_timeout: config.pool_idle_timeout,
    }));

    let tls_acceptor = match &config.tls {
        TlsMode::Disabled => None,
        TlsMode::SelfSigned => {
            let cert = tls::self_signed()?;
            warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
            Some(tls::acceptor(SniCertResolver::single(cert)))
        }
        TlsMode::CertDir(dir) => {
            let resolver = SniCertResolver::from_dir(dir)?;
            Some(tls::acceptor(resolver))
        }
    };

    let http_listener = acquire(inherited_fd(HTTP_FD_ENV), &config.http_addr).await?;
    let http_proxy = ProxyServer::new(
        http_listener,
        Arc::clone(&table),
        Arc::clone(&pool),
        shutdown_rx.clone(),
    );
    let http_proxy_handle = tokio::spawn(async move {
        if let Err(e) = http_proxy.run().await {
            error!(error = %e, "HTTP server error");
        }
    });

    let https_proxy_handle = if let Some(acceptor) = tls_acceptor {
        let https_listener = acquire(inherited_fd(HTTPS_FD_ENV), &config.https_addr).await?;
        let https_proxy = ProxyServer::new(
            https_listener,
            Arc::clone(&table),
            Arc::clone(&pool),
            shutdown_rx.clone(),
        )
        .with_tls(acceptor);

        Some(tokio::spawn(async move {
            if let Err(e) = https_proxy.run().await {
                error!(error = %e, "HTTPS server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or reload request (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config.routes_path.display(), "Received SIGHUP, checking routes...");
                    reload_trigger.notify_one();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = reload_trigger;
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_proxy_handle.await;
        if let Some(handle) = https_proxy_handle {
            let _ = handle.await;
        }
        let _ = reloader_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &ServerConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("hostgate=info".parse()?);

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", path.display(), e))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    Ok(())
}

fn print_startup_banner(config: &ServerConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        routes = %config.routes_path.display(),
        http = %config.http_addr,
        https = if config.tls_enabled() { Some(config.https_addr.as_str()) } else { None },
        tls = ?config.tls,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.pool_max_idle_per_host,
        pool_idle_timeout_ms = config.pool_idle_timeout.as_millis() as u64,
        "Connection pool settings"
    );
}
