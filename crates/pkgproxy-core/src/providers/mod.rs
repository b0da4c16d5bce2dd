//! Package source providers.
//!
//! A provider recognizes requests for one package ecosystem, decides which
//! upstream actually serves them, and names the cache key they are stored
//! under. The key is derived from the request URL before rewriting so the
//! same package keeps one cache entry regardless of which mirror served it.

mod chain;
mod direct;
mod ubuntu;

use std::fmt::Debug;
use std::time::Duration;

use reqwest::Url;

pub use chain::{ProviderChain, Resolution};
pub use direct::DirectProvider;
pub use ubuntu::{MirrorSelection, UbuntuProvider, UBUNTU_MIRRORS_URL};

/// A package source.
pub trait Provider: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Returns true if this provider handles `url`.
    fn matches(&self, url: &Url) -> bool;

    /// Returns the URL to fetch from upstream.
    fn rewrite(&self, url: &Url) -> Url;

    /// Returns the cache key for `url`, computed before rewriting.
    fn cache_key(&self, url: &Url) -> String;

    /// Returns a provider specific max-age for `url`, if any.
    ///
    /// `None` defers to the global refresh patterns.
    fn max_age(&self, url: &Url) -> Option<Duration>;
}
