//! Package Proxy - caching forward proxy for package managers.
//!
//! This binary wires the pieces together:
//! - Expiring on-disk store with a background sweeper
//! - Provider chain (Ubuntu mirror substitution, direct passthrough)
//! - Mirror benchmark for the Ubuntu provider
//! - Caching proxy with optional TLS interception

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use pkgproxy_core::{
    BenchmarkConfig, ProviderChain, RefreshPatterns, UbuntuProvider, UBUNTU_MIRRORS_URL,
};
use pkgproxy_proxy::{CaManager, ProxyConfig, ProxyServer};
use pkgproxy_storage::{ExpiringStore, DEFAULT_SWEEP_INTERVAL};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Package Proxy - caching proxy for package managers
#[derive(Parser, Debug)]
#[command(name = "package-proxy", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3142")]
    listen: SocketAddr,

    /// Cache directory
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Decrypt CONNECT tunnels for intercepted hosts
    #[arg(long)]
    tls: bool,

    /// CA certificate (PEM)
    #[arg(long, requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// CA private key (PEM)
    #[arg(long, requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Create the CA if it does not exist yet
    #[arg(long)]
    generate_ca: bool,

    /// Host to intercept (repeatable, `*` and `*.domain` allowed).
    /// Defaults to every host when --tls is set.
    #[arg(long = "intercept-host", value_name = "HOST")]
    intercept_hosts: Vec<String>,

    /// Substitute the fastest Ubuntu mirror for archive.ubuntu.com
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    ubuntu: bool,

    /// Ubuntu mirror registry
    #[arg(long, default_value = UBUNTU_MIRRORS_URL)]
    mirror_list: String,

    /// JSON file of `{"pattern", "duration"}` refresh patterns
    #[arg(long)]
    patterns: Option<PathBuf>,

    /// Interval between expiry sweeps
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    sweep_interval: Duration,

    /// Budget for the mirror benchmark
    #[arg(long, default_value = "20s", value_parser = humantime::parse_duration)]
    benchmark_timeout: Duration,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Also write daily-rotated logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// fsync every cached blob before acknowledging it
    #[arg(long)]
    sync_writes: bool,
}

impl Args {
    fn log_filter(&self) -> String {
        let level = if self.debug { "debug" } else { &self.log_level };
        format!("package_proxy={level},pkgproxy={level},warn")
    }

    fn cache_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(ExpiringStore::default_dir)
    }

    fn ca_manager(&self) -> anyhow::Result<CaManager> {
        match (&self.ca_cert, &self.ca_key) {
            (Some(cert), Some(key)) => Ok(CaManager::from_paths(cert, key)),
            _ => Ok(CaManager::with_default_dir()?),
        }
    }

    fn intercept_hosts(&self) -> Vec<String> {
        if !self.tls {
            Vec::new()
        } else if self.intercept_hosts.is_empty() {
            vec!["*".to_string()]
        } else {
            self.intercept_hosts.clone()
        }
    }

    fn load_patterns(&self) -> anyhow::Result<RefreshPatterns> {
        match &self.patterns {
            Some(path) => RefreshPatterns::from_json_file(path)
                .with_context(|| format!("Failed to load refresh patterns from {:?}", path)),
            None => Ok(RefreshPatterns::apt_defaults()),
        }
    }

    fn proxy_config(&self) -> anyhow::Result<ProxyConfig> {
        let mut config = ProxyConfig::new()
            .with_addr(self.listen)
            .with_intercept_hosts(self.intercept_hosts());

        if config.intercepts() {
            let ca_manager = self.ca_manager()?;
            if self.generate_ca {
                ca_manager
                    .ensure_ca()
                    .context("Failed to generate CA certificate")?;
            }
            config = config.with_ca_manager(ca_manager);
        }

        Ok(config)
    }
}

/// Initialize logging, optionally with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("package-proxy")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable in {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

/// Builds the provider chain, starting the Ubuntu mirror benchmark if enabled.
///
/// A failed mirror-list fetch only disables the Ubuntu provider.
async fn build_chain(args: &Args, patterns: RefreshPatterns) -> anyhow::Result<ProviderChain> {
    let mut chain = ProviderChain::new(patterns);
    if !args.ubuntu {
        return Ok(chain);
    }

    let client = reqwest::Client::builder()
        .no_proxy()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;
    let config = BenchmarkConfig::default().with_timeout(args.benchmark_timeout);

    match UbuntuProvider::bootstrap(client, &args.mirror_list, config).await {
        Ok((provider, _benchmark)) => {
            tracing::info!("Ubuntu provider using placeholder mirror {}", provider.mirror());
            chain = chain.with_provider(provider);
        }
        Err(e) => {
            tracing::warn!("Ubuntu provider disabled: {}", e);
        }
    }

    Ok(chain)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Package Proxy v{}", env!("CARGO_PKG_VERSION"));

    if !args.tls && !args.intercept_hosts.is_empty() {
        bail!("--intercept-host requires --tls");
    }

    let patterns = args.load_patterns()?;
    let proxy_config = args.proxy_config()?;

    let cache_dir = args.cache_dir();
    let store = ExpiringStore::open(&cache_dir)
        .with_context(|| format!("Failed to open cache at {:?}", cache_dir))?
        .with_sync_writes(args.sync_writes);
    tracing::info!("Cache at {:?} ({} records)", cache_dir, store.index().len());

    let sweep_interval = if args.sweep_interval.is_zero() {
        DEFAULT_SWEEP_INTERVAL
    } else {
        args.sweep_interval
    };
    let sweeper = store.start_sweeper(sweep_interval);

    let chain = build_chain(&args, patterns).await?;
    let server = ProxyServer::new(proxy_config, store.clone(), chain)?;
    if let Some(path) = server.ca_cert_path() {
        tracing::info!("Clients must trust {:?}", path);
    }
    let handle = server.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    handle.stop().await;
    sweeper.stop().await;
    match store.save() {
        Ok(saved) => tracing::info!("Saved {} records", saved),
        Err(e) => tracing::error!("Failed to save records: {}", e),
    }

    Ok(())
}
