//! Caching proxy server.
//!
//! Wires the provider chain and cache transport into a hudsucker proxy.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use pkgproxy_core::ProviderChain;
use pkgproxy_storage::ExpiringStore;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::{HandlerConfig, ProxyHandler};
use crate::tls::{InterceptPolicy, SessionAuthority};
use crate::transport::{CacheTransport, ReqwestUpstream, StoreMode, Upstream};
use crate::DEFAULT_PROXY_PORT;

/// Identity used in `X-Cache` and `Via` when none is configured.
pub const DEFAULT_SERVER_ID: &str = "package-proxy";

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager, required when any host is intercepted.
    pub ca_manager: Option<CaManager>,
    /// Hosts whose CONNECT tunnels are decrypted.
    pub intercept: InterceptPolicy,
    /// Name reported in cache status and `Via` headers.
    pub server_id: String,
    /// When fetched responses are written to the store.
    pub store_mode: StoreMode,
}

impl ProxyConfig {
    /// Creates a configuration listening on all interfaces with nothing
    /// intercepted.
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PROXY_PORT)),
            ca_manager: None,
            intercept: InterceptPolicy::none(),
            server_id: DEFAULT_SERVER_ID.to_string(),
            store_mode: StoreMode::default(),
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port, keeping the host.
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = Some(ca_manager);
        self
    }

    /// Sets the hosts to intercept (`*` and `*.domain` allowed).
    pub fn with_intercept_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.intercept = InterceptPolicy::from_hosts(hosts);
        self
    }

    /// Sets the server identity.
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Sets the store write mode.
    pub fn with_store_mode(mut self, store_mode: StoreMode) -> Self {
        self.store_mode = store_mode;
        self
    }

    /// Returns true if any CONNECT tunnel may be decrypted.
    pub fn intercepts(&self) -> bool {
        !self.intercept.is_empty()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Caching forward proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    authority: SessionAuthority,
    handler_config: HandlerConfig,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("handler_config", &self.handler_config)
            .finish()
    }
}

impl ProxyServer {
    /// Creates a proxy that fetches upstream with `reqwest`.
    ///
    /// Fails if interception is enabled and the CA cannot be loaded.
    pub fn new(config: ProxyConfig, store: ExpiringStore, chain: ProviderChain) -> Result<Self> {
        let upstream = Arc::new(ReqwestUpstream::new()?);
        Self::with_upstream(config, store, chain, upstream)
    }

    /// Creates a proxy with a custom upstream.
    pub fn with_upstream(
        config: ProxyConfig,
        store: ExpiringStore,
        chain: ProviderChain,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self> {
        let (authority, ca_cert_pem) = if config.intercepts() {
            let ca_manager = config.ca_manager.as_ref().ok_or_else(|| {
                ProxyError::Config("TLS interception needs a CA certificate and key".into())
            })?;
            let ca = ca_manager.load()?;
            let pem: Arc<str> = Arc::from(ca.cert_pem.as_str());
            (SessionAuthority::new(ca)?, Some(pem))
        } else {
            (SessionAuthority::ephemeral()?, None)
        };

        let transport = CacheTransport::new(store, upstream, config.server_id.clone())
            .with_store_mode(config.store_mode);

        let handler_config = HandlerConfig {
            chain: Arc::new(chain),
            transport: Arc::new(transport),
            intercept: Arc::new(config.intercept.clone()),
            ca_cert_pem,
        };

        Ok(Self {
            config,
            authority,
            handler_config,
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path, if interception is configured.
    pub fn ca_cert_path(&self) -> Option<&Path> {
        self.config.ca_manager.as_ref().map(|m| m.cert_path())
    }

    /// Returns the cache transport shared by all requests.
    pub fn transport(&self) -> &Arc<CacheTransport> {
        &self.handler_config.transport
    }

    /// Binds the listen address and serves in the background.
    ///
    /// Port 0 picks a free port; [`ProxyHandle::addr`] reports the bound one.
    pub async fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let listener = TcpListener::bind(self.config.addr).await?;
        let addr = listener.local_addr()?;

        let transport = self.handler_config.transport.clone();
        let handler = ProxyHandler::new(self.handler_config);
        let authority = self.authority;

        tracing::info!("Starting caching proxy on {}", addr);

        let handle = tokio::spawn(async move {
            let proxy = match Proxy::builder()
                .with_listener(listener)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("Failed to build proxy: {}", e);
                    return;
                }
            };

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };

            transport.flush().await;
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for pending store writes.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
