//! Mirror list retrieval and latency benchmarking.
//!
//! Every candidate is benchmarked concurrently. Collection stops after the
//! first `quorum` successful results or when the overall budget runs out,
//! whichever comes first, and the slow tasks still in flight are aborted.

use std::time::Duration;

use reqwest::{Client, Url};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Number of results that ends the benchmark early.
pub const BENCHMARK_QUORUM: usize = 3;

/// Error fetching or benchmarking mirrors.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mirror list at {0} is empty")]
    EmptyList(String),

    #[error("No mirrors to benchmark")]
    NoMirrors,

    #[error("No mirror finished the benchmark within {0:?}")]
    NoResults(Duration),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("{url} sent {got} bytes, wanted at least {want}")]
    TooFewBytes { url: String, got: usize, want: usize },

    #[error("Invalid mirror URL: {0}")]
    InvalidUrl(String),
}

/// How each mirror is measured.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Path appended to the mirror base URL.
    pub path: String,
    /// Sequential downloads per mirror; the mean is reported.
    pub attempts: u32,
    /// Bytes that must be read for an attempt to count.
    pub min_bytes: usize,
    /// Overall budget for the whole benchmark.
    pub timeout: Duration,
    /// Results to collect before stopping early.
    pub quorum: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            path: "dists/noble/main/binary-amd64/Packages.gz".to_string(),
            attempts: 2,
            min_bytes: 256 * 1024,
            timeout: Duration::from_secs(20),
            quorum: BENCHMARK_QUORUM,
        }
    }
}

impl BenchmarkConfig {
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_min_bytes(mut self, min_bytes: usize) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum;
        self
    }
}

/// Measured latency of one mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkResult {
    pub url: Url,
    pub latency: Duration,
}

/// Result of [`pick_fastest`].
#[derive(Debug, Clone)]
pub struct BenchmarkOutcome {
    /// Lowest latency mirror among the collected results.
    pub fastest: Url,
    /// Collected results, fastest first.
    pub results: Vec<BenchmarkResult>,
    /// False when the budget ran out before the quorum was reached.
    pub complete: bool,
}

/// Parses a newline-delimited mirror list, skipping blanks and bad lines.
pub fn parse_mirror_list(text: &str) -> Vec<Url> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match Url::parse(line) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Skipping invalid mirror {:?}: {}", line, e);
                None
            }
        })
        .collect()
}

/// Fetches and parses the mirror list at `registry_url`.
pub async fn fetch_mirror_list(client: &Client, registry_url: &str) -> Result<Vec<Url>, MirrorError> {
    let response = client.get(registry_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(MirrorError::Status {
            url: registry_url.to_string(),
            status: status.as_u16(),
        });
    }

    let mirrors = parse_mirror_list(&response.text().await?);
    if mirrors.is_empty() {
        return Err(MirrorError::EmptyList(registry_url.to_string()));
    }

    debug!("Fetched {} mirrors from {}", mirrors.len(), registry_url);
    Ok(mirrors)
}

/// Joins the benchmark path onto a mirror base URL.
fn benchmark_url(mirror: &Url, path: &str) -> Result<Url, MirrorError> {
    let joined = format!(
        "{}/{}",
        mirror.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| MirrorError::InvalidUrl(format!("{}: {}", joined, e)))
}

/// Returns the mean latency of `config.attempts` downloads from `mirror`.
pub async fn benchmark_mirror(
    client: &Client,
    mirror: &Url,
    config: &BenchmarkConfig,
) -> Result<Duration, MirrorError> {
    let url = benchmark_url(mirror, &config.path)?;
    let attempts = config.attempts.max(1);
    let mut total = Duration::ZERO;

    for _ in 0..attempts {
        let started = Instant::now();
        let mut response = client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut read = 0;
        while read < config.min_bytes {
            match response.chunk().await? {
                Some(chunk) => read += chunk.len(),
                None => break,
            }
        }
        if read < config.min_bytes {
            return Err(MirrorError::TooFewBytes {
                url: url.to_string(),
                got: read,
                want: config.min_bytes,
            });
        }

        total += started.elapsed();
    }

    Ok(total / attempts)
}

/// Benchmarks `mirrors` concurrently and returns the fastest responder.
///
/// Waits for `min(quorum, mirrors.len())` successful results or until
/// `config.timeout`, whichever comes first. A partial set is accepted with a
/// warning; zero results is an error.
pub async fn pick_fastest(
    client: &Client,
    mirrors: &[Url],
    config: &BenchmarkConfig,
) -> Result<BenchmarkOutcome, MirrorError> {
    if mirrors.is_empty() {
        return Err(MirrorError::NoMirrors);
    }

    let want = config.quorum.clamp(1, mirrors.len());
    let deadline = Instant::now() + config.timeout;

    let mut tasks = JoinSet::new();
    for mirror in mirrors {
        let client = client.clone();
        let mirror = mirror.clone();
        let config = config.clone();
        tasks.spawn(async move {
            let result = benchmark_mirror(&client, &mirror, &config).await;
            (mirror, result)
        });
    }

    let mut results = Vec::with_capacity(want);
    while results.len() < want {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok((url, Ok(latency))))) => {
                debug!("Mirror {} answered in {:?}", url, latency);
                results.push(BenchmarkResult { url, latency });
            }
            Ok(Some(Ok((url, Err(e))))) => debug!("Mirror {} failed benchmark: {}", url, e),
            Ok(Some(Err(e))) => warn!("Benchmark task failed: {}", e),
            Ok(None) => break,
            Err(_) => {
                debug!("Benchmark budget of {:?} exhausted", config.timeout);
                break;
            }
        }
    }

    // Abandon whatever is still running.
    tasks.abort_all();

    results.sort_by_key(|r| r.latency);
    let Some(fastest) = results.first().map(|r| r.url.clone()) else {
        return Err(MirrorError::NoResults(config.timeout));
    };

    let complete = results.len() >= want;
    if !complete {
        warn!(
            "Only {} of {} mirror benchmarks finished, using best partial result {}",
            results.len(),
            want,
            fastest
        );
    }

    Ok(BenchmarkOutcome {
        fastest,
        results,
        complete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_blanks_and_invalid_lines() {
        let mirrors = parse_mirror_list(
            "http://a.example/ubuntu/\n\n  https://b.example/ubuntu/  \n# comment\nnot a url\n",
        );
        assert_eq!(
            mirrors,
            vec![
                Url::parse("http://a.example/ubuntu/").unwrap(),
                Url::parse("https://b.example/ubuntu/").unwrap(),
            ]
        );
    }

    #[test]
    fn benchmark_url_joins_without_double_slash() {
        let mirror = Url::parse("http://a.example/ubuntu/").unwrap();
        assert_eq!(
            benchmark_url(&mirror, "/dists/noble/Release").unwrap().as_str(),
            "http://a.example/ubuntu/dists/noble/Release"
        );
    }

    #[test]
    fn default_config_values() {
        let config = BenchmarkConfig::default();
        assert_eq!(config.attempts, 2);
        assert_eq!(config.min_bytes, 262_144);
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.quorum, 3);
    }

    #[tokio::test]
    async fn empty_mirror_set_is_an_error() {
        let client = Client::new();
        let err = pick_fastest(&client, &[], &BenchmarkConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::NoMirrors));
    }
}
