//! Refresh patterns: ordered regex to TTL rules.
//!
//! Patterns are evaluated in declaration order against the full request URL
//! and the first match wins. Construction validates every regex and duration
//! up front, so a bad pattern is a startup error rather than a request error.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error building refresh patterns.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The regex failed to compile.
    #[error("invalid refresh pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The duration string failed to parse.
    #[error("invalid duration {duration:?} for pattern {pattern:?}: {source}")]
    Duration {
        pattern: String,
        duration: String,
        #[source]
        source: humantime::DurationError,
    },

    /// The pattern file could not be read.
    #[error("failed to read refresh patterns: {0}")]
    Io(#[from] std::io::Error),

    /// The pattern file is not valid JSON.
    #[error("failed to parse refresh patterns: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unparsed refresh pattern as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPattern {
    /// Regex matched against the request URL.
    pub pattern: String,
    /// Freshness window, e.g. `72h` or `1week`.
    pub duration: String,
}

impl RefreshPattern {
    /// Creates a new unparsed pattern.
    pub fn new(pattern: impl Into<String>, duration: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            duration: duration.into(),
        }
    }
}

/// A compiled refresh rule.
#[derive(Debug, Clone)]
pub struct RefreshRule {
    regex: Regex,
    ttl: Duration,
}

impl RefreshRule {
    /// Compiles a rule from a regex and a TTL.
    pub fn new(pattern: &str, ttl: Duration) -> Result<Self, PatternError> {
        let regex = Regex::new(pattern).map_err(|source| PatternError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { regex, ttl })
    }

    /// Returns the source regex.
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Returns the TTL assigned on match.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns true if the rule matches `url`.
    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }
}

impl fmt::Display for RefreshRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.regex.as_str(),
            humantime::format_duration(self.ttl)
        )
    }
}

/// Ordered list of refresh rules.
#[derive(Debug, Clone, Default)]
pub struct RefreshPatterns {
    rules: Vec<RefreshRule>,
}

/// Default rules for apt repositories.
const APT_PATTERNS: &[(&str, &str)] = &[
    (r"deb$", "1week"),
    (r"udeb$", "1week"),
    (r"DiffIndex$", "1h"),
    (r"PackagesIndex$", "1h"),
    (r"Packages\.(bz2|gz|lzma|xz)$", "1h"),
    (r"SourcesIndex$", "1h"),
    (r"Sources\.(bz2|gz|lzma|xz)$", "1h"),
    (r"(In)?Release(\.gpg)?$", "1h"),
    (r"Translation-(en|fr)\.(gz|bz2|bzip2|lzma|xz)$", "1h"),
];

impl RefreshPatterns {
    /// Compiles configured patterns, failing on the first invalid entry.
    pub fn parse(source: &[RefreshPattern]) -> Result<Self, PatternError> {
        let rules = source
            .iter()
            .map(|p| {
                let ttl = humantime::parse_duration(&p.duration).map_err(|source| {
                    PatternError::Duration {
                        pattern: p.pattern.clone(),
                        duration: p.duration.clone(),
                        source,
                    }
                })?;
                RefreshRule::new(&p.pattern, ttl)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules })
    }

    /// Creates patterns from already compiled rules.
    pub fn from_rules(rules: Vec<RefreshRule>) -> Self {
        Self { rules }
    }

    /// Loads patterns from a JSON array of `{"pattern", "duration"}` objects.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PatternError> {
        let json = std::fs::read(path)?;
        let source: Vec<RefreshPattern> = serde_json::from_slice(&json)?;
        Self::parse(&source)
    }

    /// Returns the built-in apt rules.
    pub fn apt_defaults() -> Self {
        let source: Vec<RefreshPattern> = APT_PATTERNS
            .iter()
            .map(|(pattern, duration)| RefreshPattern::new(*pattern, *duration))
            .collect();
        Self::parse(&source).expect("built-in refresh patterns are valid")
    }

    /// Returns the TTL of the first rule matching `url`.
    pub fn matches(&self, url: &str) -> Option<Duration> {
        self.find(url).map(RefreshRule::ttl)
    }

    /// Returns the first rule matching `url`.
    pub fn find(&self, url: &str) -> Option<&RefreshRule> {
        self.rules.iter().find(|rule| rule.is_match(url))
    }

    /// Iterates over the rules in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &RefreshRule> {
        self.rules.iter()
    }

    /// Returns the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn first_match_wins() {
        let patterns = RefreshPatterns::parse(&[
            RefreshPattern::new(r".*\.deb$", "1h"),
            RefreshPattern::new(r".*", "5m"),
        ])
        .unwrap();

        assert_eq!(
            patterns.matches("http://archive.ubuntu.com/ubuntu/pool/main/a/apt/apt_2.7_amd64.deb"),
            Some(HOUR)
        );
        assert_eq!(
            patterns.matches("http://archive.ubuntu.com/ubuntu/dists/noble/Release"),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn no_match_returns_none() {
        let patterns =
            RefreshPatterns::parse(&[RefreshPattern::new(r"\.deb$", "1h")]).unwrap();
        assert_eq!(patterns.matches("http://example.com/index.html"), None);
    }

    #[test]
    fn invalid_regex_fails_fast() {
        let err = RefreshPatterns::parse(&[RefreshPattern::new(r"(unclosed", "1h")]).unwrap_err();
        assert!(matches!(err, PatternError::Regex { .. }));
    }

    #[test]
    fn invalid_duration_fails_fast() {
        let err = RefreshPatterns::parse(&[
            RefreshPattern::new(r"deb$", "1h"),
            RefreshPattern::new(r"udeb$", "two days"),
        ])
        .unwrap_err();
        assert!(matches!(err, PatternError::Duration { .. }));
    }

    #[test]
    fn apt_defaults_cover_packages_and_indexes() {
        let patterns = RefreshPatterns::apt_defaults();

        assert_eq!(
            patterns.matches("http://archive.ubuntu.com/ubuntu/pool/main/c/curl/curl_8.5_amd64.deb"),
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        assert_eq!(
            patterns.matches("http://archive.ubuntu.com/ubuntu/dists/noble/InRelease"),
            Some(HOUR)
        );
        assert_eq!(
            patterns.matches("http://archive.ubuntu.com/ubuntu/dists/noble/main/binary-amd64/Packages.xz"),
            Some(HOUR)
        );
        assert_eq!(patterns.matches("http://example.com/"), None);
    }

    #[test]
    fn loads_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("patterns.json");
        std::fs::write(
            &path,
            r#"[{"pattern": "\\.crate$", "duration": "30days"}, {"pattern": "index", "duration": "10m"}]"#,
        )
        .unwrap();

        let patterns = RefreshPatterns::from_json_file(&path).unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(
            patterns.matches("https://static.crates.io/crates/serde/serde-1.0.0.crate"),
            Some(Duration::from_secs(30 * 24 * 3600))
        );
    }

    #[test]
    fn rule_display_shows_pattern_and_ttl() {
        let rule = RefreshRule::new(r"deb$", HOUR).unwrap();
        assert_eq!(rule.to_string(), "deb$ 1h");
    }
}
