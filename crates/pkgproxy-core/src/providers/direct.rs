use std::time::Duration;

use reqwest::Url;

use super::Provider;
use crate::canonical::canonical_url;

/// Passthrough provider used when nothing else matches.
///
/// Fetches the request URL as is and keys it by its canonical form.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectProvider;

impl Provider for DirectProvider {
    fn name(&self) -> &str {
        "direct"
    }

    fn matches(&self, _url: &Url) -> bool {
        true
    }

    fn rewrite(&self, url: &Url) -> Url {
        url.clone()
    }

    fn cache_key(&self, url: &Url) -> String {
        canonical_url(url)
    }

    fn max_age(&self, _url: &Url) -> Option<Duration> {
        None
    }
}
