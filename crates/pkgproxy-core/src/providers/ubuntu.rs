//! Ubuntu archive provider with mirror substitution.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use reqwest::{Client, Url};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Provider;
use crate::mirrors::{fetch_mirror_list, pick_fastest, BenchmarkConfig, MirrorError};
use crate::patterns::{RefreshPattern, RefreshPatterns};

/// Registry of geographically close Ubuntu mirrors.
pub const UBUNTU_MIRRORS_URL: &str = "http://mirrors.ubuntu.com/mirrors.txt";

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(48 * 3600);

const ARCHIVE_HOSTS: &[&str] = &["archive.ubuntu.com", "security.ubuntu.com"];
const PPA_HOST: &str = "ppa.launchpad.net";

const UBUNTU_PATTERNS: &[(&str, &str)] = &[
    (r"deb$", "72h"),
    (r"udeb$", "72h"),
    (r"tar\.gz$", "72h"),
    (r"DiffIndex$", "48h"),
    (r"PackagesIndex$", "48h"),
    (r"Packages\.(bz2|gz|lzma|xz)$", "48h"),
    (r"SourcesIndex$", "48h"),
    (r"Sources\.(bz2|gz|lzma|xz)$", "48h"),
    (r"(In)?Release(\.gpg)?$", "48h"),
    (r"Translation-(en|fr)\.(gz|bz2|bzip2|lzma|xz)$", "48h"),
];

/// The currently selected mirror.
///
/// Written by the benchmark task, read by every request.
#[derive(Debug, Clone)]
pub struct MirrorSelection {
    current: Arc<RwLock<Url>>,
}

impl MirrorSelection {
    pub fn new(mirror: Url) -> Self {
        Self {
            current: Arc::new(RwLock::new(mirror)),
        }
    }

    /// Returns a copy of the selected mirror.
    pub fn current(&self) -> Url {
        self.current.read().clone()
    }

    /// Swaps in a new mirror and returns the previous one.
    pub fn replace(&self, mirror: Url) -> Url {
        std::mem::replace(&mut *self.current.write(), mirror)
    }
}

/// Provider for `archive.ubuntu.com`, `security.ubuntu.com` and Launchpad PPAs.
#[derive(Debug)]
pub struct UbuntuProvider {
    patterns: RefreshPatterns,
    mirror: MirrorSelection,
}

impl UbuntuProvider {
    /// Creates a provider that rewrites archive requests to `mirror`.
    pub fn new(mirror: Url) -> Self {
        let source: Vec<RefreshPattern> = UBUNTU_PATTERNS
            .iter()
            .map(|(pattern, duration)| RefreshPattern::new(*pattern, *duration))
            .collect();
        let patterns =
            RefreshPatterns::parse(&source).expect("built-in ubuntu refresh patterns are valid");

        Self {
            patterns,
            mirror: MirrorSelection::new(mirror),
        }
    }

    /// Creates a provider using a uniformly random placeholder from `mirrors`.
    pub fn with_random_mirror(mirrors: &[Url]) -> Result<Self, MirrorError> {
        let mirror = mirrors
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(MirrorError::NoMirrors)?;

        info!("Using ubuntu mirror {} whilst benchmarking", mirror);
        Ok(Self::new(mirror))
    }

    /// Fetches the mirror list, picks a placeholder and starts benchmarking.
    ///
    /// The provider is usable immediately. The returned handle resolves once
    /// the benchmark finished and the winner, if any, was swapped in.
    pub async fn bootstrap(
        client: Client,
        registry_url: &str,
        config: BenchmarkConfig,
    ) -> Result<(Arc<Self>, JoinHandle<Result<Url, MirrorError>>), MirrorError> {
        let mirrors = fetch_mirror_list(&client, registry_url).await?;
        let provider = Arc::new(Self::with_random_mirror(&mirrors)?);
        let benchmark = provider.spawn_benchmark(client, mirrors, config);
        Ok((provider, benchmark))
    }

    /// Benchmarks `mirrors` in the background and swaps in the fastest.
    ///
    /// On failure the current mirror is kept.
    pub fn spawn_benchmark(
        &self,
        client: Client,
        mirrors: Vec<Url>,
        config: BenchmarkConfig,
    ) -> JoinHandle<Result<Url, MirrorError>> {
        let selection = self.mirror.clone();

        tokio::spawn(async move {
            match pick_fastest(&client, &mirrors, &config).await {
                Ok(outcome) => {
                    info!("Benchmark complete, using ubuntu mirror {}", outcome.fastest);
                    selection.replace(outcome.fastest.clone());
                    Ok(outcome.fastest)
                }
                Err(e) => {
                    warn!(
                        "Mirror benchmark failed, keeping {}: {}",
                        selection.current(),
                        e
                    );
                    Err(e)
                }
            }
        })
    }

    /// Returns the currently selected mirror.
    pub fn mirror(&self) -> Url {
        self.mirror.current()
    }

    /// Returns the shared mirror selection.
    pub fn selection(&self) -> &MirrorSelection {
        &self.mirror
    }

    /// Returns the archive-relative path for archive hosts.
    fn archive_path<'a>(&self, url: &'a Url) -> Option<&'a str> {
        let host = url.host_str()?;
        if !ARCHIVE_HOSTS.iter().any(|h| host_is(host, h)) {
            return None;
        }
        url.path()
            .strip_prefix("/ubuntu/")
            .filter(|rest| !rest.is_empty())
    }
}

/// Matches `host` exactly or as a subdomain such as `us.archive.ubuntu.com`.
fn host_is(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl Provider for UbuntuProvider {
    fn name(&self) -> &str {
        "ubuntu"
    }

    fn matches(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| {
            ARCHIVE_HOSTS
                .iter()
                .chain(std::iter::once(&PPA_HOST))
                .any(|domain| host_is(host, domain))
        })
    }

    fn rewrite(&self, url: &Url) -> Url {
        let Some(path) = self.archive_path(url) else {
            return url.clone();
        };

        let mirror = self.mirror.current();
        let base = mirror.as_str().trim_end_matches('/');
        match Url::parse(&format!("{}/{}", base, path)) {
            Ok(mut rewritten) => {
                rewritten.set_query(url.query());
                rewritten
            }
            Err(e) => {
                warn!("Cannot rewrite {} onto mirror {}: {}", url, mirror, e);
                url.clone()
            }
        }
    }

    /// Keys never include the mirror, so they stay valid across a switch.
    ///
    /// - `ubuntu/<path>` for archive content under `/ubuntu/`
    /// - `ubuntu/ppa/<host><path>` for PPAs
    /// - `ubuntu/host/<host><path>` for anything else on an archive host
    ///
    /// The query string is not part of the key; apt never sends one.
    fn cache_key(&self, url: &Url) -> String {
        if let Some(path) = self.archive_path(url) {
            return format!("ubuntu/{}", path);
        }

        let host = url.host_str().unwrap_or_default();
        let label = if host_is(host, PPA_HOST) { "ppa" } else { "host" };
        format!("ubuntu/{}/{}{}", label, host, url.path())
    }

    fn max_age(&self, url: &Url) -> Option<Duration> {
        Some(self.patterns.matches(url.as_str()).unwrap_or(DEFAULT_MAX_AGE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn provider() -> UbuntuProvider {
        UbuntuProvider::new(url("http://mirror.a.example/ubuntu/"))
    }

    #[test]
    fn matches_archive_security_and_ppa_hosts() {
        let p = provider();
        assert!(p.matches(&url("http://archive.ubuntu.com/ubuntu/dists/noble/Release")));
        assert!(p.matches(&url("http://us.archive.ubuntu.com/ubuntu/dists/noble/Release")));
        assert!(p.matches(&url("http://security.ubuntu.com/ubuntu/pool/x.deb")));
        assert!(p.matches(&url("http://ppa.launchpad.net/deadsnakes/ppa/ubuntu/x.deb")));
        assert!(!p.matches(&url("http://notarchive.ubuntu.com.evil.test/ubuntu/x.deb")));
        assert!(!p.matches(&url("http://registry.npmjs.org/left-pad")));
    }

    #[test]
    fn rewrites_archive_onto_mirror() {
        let p = provider();
        let rewritten = p.rewrite(&url(
            "http://gb.archive.ubuntu.com/ubuntu/pool/main/a/apt/apt_2.7_amd64.deb",
        ));
        assert_eq!(
            rewritten.as_str(),
            "http://mirror.a.example/ubuntu/pool/main/a/apt/apt_2.7_amd64.deb"
        );
    }

    #[test]
    fn ppa_is_not_rewritten() {
        let p = provider();
        let ppa = url("http://ppa.launchpad.net/deadsnakes/ppa/ubuntu/dists/noble/Release");
        assert_eq!(p.rewrite(&ppa), ppa);
        assert_eq!(
            p.cache_key(&ppa),
            "ubuntu/ppa/ppa.launchpad.net/deadsnakes/ppa/ubuntu/dists/noble/Release"
        );
    }

    #[test]
    fn archive_host_outside_ubuntu_tree_is_not_labelled_ppa() {
        let p = provider();
        let other = url("http://archive.ubuntu.com/ubuntu-ports/dists/noble/Release");
        assert_eq!(p.rewrite(&other), other);
        assert_eq!(
            p.cache_key(&other),
            "ubuntu/host/archive.ubuntu.com/ubuntu-ports/dists/noble/Release"
        );
    }

    #[test]
    fn query_is_not_part_of_the_key() {
        let p = provider();
        let plain = url("http://archive.ubuntu.com/ubuntu/pool/main/a/apt/apt.deb");
        let queried = url("http://archive.ubuntu.com/ubuntu/pool/main/a/apt/apt.deb?x=1");
        assert_eq!(p.cache_key(&plain), p.cache_key(&queried));
    }

    #[test]
    fn cache_key_is_stable_across_mirror_switch() {
        let p = provider();
        let request = url("http://archive.ubuntu.com/ubuntu/pool/main/c/curl/curl_8.5_amd64.deb");

        let key_before = p.cache_key(&request);
        let upstream_before = p.rewrite(&request);

        p.selection()
            .replace(url("https://mirror.b.example/pub/ubuntu"));

        let key_after = p.cache_key(&request);
        let upstream_after = p.rewrite(&request);

        assert_eq!(key_before, "ubuntu/pool/main/c/curl/curl_8.5_amd64.deb");
        assert_eq!(key_before, key_after);
        assert_ne!(upstream_before, upstream_after);
        assert_eq!(
            upstream_after.as_str(),
            "https://mirror.b.example/pub/ubuntu/pool/main/c/curl/curl_8.5_amd64.deb"
        );
    }

    #[test]
    fn max_age_uses_ubuntu_patterns_with_default() {
        let p = provider();
        assert_eq!(
            p.max_age(&url("http://archive.ubuntu.com/ubuntu/pool/x_1.0.tar.gz")),
            Some(Duration::from_secs(72 * 3600))
        );
        assert_eq!(
            p.max_age(&url("http://archive.ubuntu.com/ubuntu/some/other/file")),
            Some(DEFAULT_MAX_AGE)
        );
    }

    #[test]
    fn random_placeholder_comes_from_list() {
        let mirrors = vec![url("http://a.example/ubuntu/"), url("http://b.example/ubuntu/")];
        let p = UbuntuProvider::with_random_mirror(&mirrors).unwrap();
        assert!(mirrors.contains(&p.mirror()));

        assert!(matches!(
            UbuntuProvider::with_random_mirror(&[]),
            Err(MirrorError::NoMirrors)
        ));
    }
}
