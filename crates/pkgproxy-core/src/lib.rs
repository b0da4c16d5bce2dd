//! Package Proxy Core - cache policy and mirror selection.
//!
//! This crate holds the parts of the proxy that decide *what* to cache and
//! *where* to fetch it from, without doing any proxy I/O itself:
//!
//! - Refresh patterns mapping URLs to freshness windows
//! - Canonical URL normalisation for cache keys
//! - The provider chain (Ubuntu mirror substitution, direct passthrough)
//! - Mirror list retrieval and first-K latency benchmarking

pub mod canonical;
pub mod mirrors;
pub mod patterns;
pub mod providers;

pub use canonical::canonical_url;
pub use mirrors::{
    benchmark_mirror, fetch_mirror_list, parse_mirror_list, pick_fastest, BenchmarkConfig,
    BenchmarkOutcome, BenchmarkResult, MirrorError, BENCHMARK_QUORUM,
};
pub use patterns::{PatternError, RefreshPattern, RefreshPatterns, RefreshRule};
pub use providers::{
    DirectProvider, MirrorSelection, Provider, ProviderChain, Resolution, UbuntuProvider,
    UBUNTU_MIRRORS_URL,
};
pub use reqwest::Url;
