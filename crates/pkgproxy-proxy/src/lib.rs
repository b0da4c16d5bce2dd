//! Package Proxy data-plane - caching HTTP/HTTPS forward proxy.
//!
//! This crate turns the policy from `pkgproxy-core` and the store from
//! `pkgproxy-storage` into a running proxy.
//!
//! ## Features
//!
//! - Serves package downloads from an expiring on-disk cache
//! - Rewrites requests onto the fastest known mirror
//! - Decrypts CONNECT tunnels for allow-listed hosts with per-session leaf
//!   certificates, relaying everything else blind
//! - Serves its CA certificate at `/package-proxy.pem`
//!
//! ## Architecture
//!
//! ```text
//! Client → hudsucker ─ CONNECT ─→ allow-listed? ── no ──→ blind tunnel
//!              │                       │ yes
//!              │                       ▼
//!              │                 leaf cert (CA)
//!              ▼                       │
//!        Provider Chain ←──────────────┘
//!              │  upstream URL, cache key, max-age
//!              ▼
//!        Cache Transport ── HIT ──→ store
//!              │ MISS / SKIP
//!              ▼
//!           upstream
//! ```

mod ca;
mod error;
mod handler;
mod proxy;
mod tls;
pub mod transport;

pub use ca::{CaManager, CaManagerError, LoadedCa};
pub use error::{ProxyError, Result};
pub use handler::{HandlerConfig, ProxyHandler, CA_CERT_PATH};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_SERVER_ID};
pub use tls::{InterceptPolicy, MitmSession, SessionAuthority};
pub use transport::{
    CacheStatus, CacheTransport, ReqwestUpstream, StoreMode, Upstream, CACHE_HEADER,
    CACHE_LOOKUP_HEADER, CANONICAL_URL_HEADER, MAX_AGE_HEADER,
};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 3142;
