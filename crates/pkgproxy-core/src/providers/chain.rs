use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;

use super::{DirectProvider, Provider};
use crate::canonical::canonical_url;
use crate::patterns::RefreshPatterns;

/// Everything the transport needs to know about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Name of the provider that claimed the request.
    pub provider: String,
    /// Canonical form of the request URL before rewriting.
    pub canonical_url: String,
    /// URL to fetch from upstream.
    pub upstream: Url,
    /// Key the response is cached under.
    pub cache_key: String,
    /// Freshness window; `None` means the request is not cacheable.
    pub max_age: Option<Duration>,
}

/// Ordered providers plus the global refresh patterns.
///
/// Exactly one provider is applied per request: the first that matches, or
/// the direct passthrough when none does.
#[derive(Debug, Clone)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn Provider>>,
    fallback: DirectProvider,
    patterns: Arc<RefreshPatterns>,
}

impl ProviderChain {
    pub fn new(patterns: RefreshPatterns) -> Self {
        Self {
            providers: Vec::new(),
            fallback: DirectProvider,
            patterns: Arc::new(patterns),
        }
    }

    /// Appends a provider; earlier providers win.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn patterns(&self) -> &RefreshPatterns {
        &self.patterns
    }

    /// Returns the first provider matching `url`, or the direct fallback.
    pub fn select(&self, url: &Url) -> &dyn Provider {
        self.providers
            .iter()
            .find(|p| p.matches(url))
            .map(|p| p.as_ref())
            .unwrap_or(&self.fallback)
    }

    /// Applies the selected provider to `url`.
    ///
    /// A provider max-age overrides the global refresh patterns.
    pub fn resolve(&self, url: &Url) -> Resolution {
        let provider = self.select(url);
        let max_age = provider
            .max_age(url)
            .or_else(|| self.patterns.matches(url.as_str()));

        Resolution {
            provider: provider.name().to_string(),
            canonical_url: canonical_url(url),
            upstream: provider.rewrite(url),
            cache_key: provider.cache_key(url),
            max_age,
        }
    }
}
