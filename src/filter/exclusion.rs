//! Proxy exclusion (no_proxy) matching

use serde::{Deserialize, Serialize};

/// How a pattern is compared against a destination host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The host contains the pattern anywhere
    #[default]
    Substring,
    /// The host equals the pattern or ends with it on a label boundary
    Suffix,
}

/// Ordered list of host patterns that bypass the proxy.
///
/// An empty list means every host is proxied.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
    patterns: Vec<String>,
    mode: MatchMode,
}

impl ExclusionList {
    pub fn new(patterns: Vec<String>, mode: MatchMode) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns, mode }
    }

    /// Parse a comma-separated pattern list with substring matching
    pub fn parse(csv: &str) -> Self {
        Self::new(Self::split(csv), MatchMode::Substring)
    }

    /// An empty list: always proxy
    pub fn none() -> Self {
        Self::default()
    }

    /// Split a comma-separated list, dropping blank entries
    pub fn split(csv: &str) -> Vec<String> {
        csv.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Whether a call to `host` must go through the proxy.
    ///
    /// The first matching pattern decides; later patterns are not checked.
    pub fn is_proxy_required(&self, host: &str) -> bool {
        match self.matching_pattern(host) {
            Some(pattern) => {
                tracing::trace!(host = %host, pattern = %pattern, "Host excluded from proxy");
                false
            }
            None => true,
        }
    }

    /// The first pattern matching `host`, if any
    pub fn matching_pattern(&self, host: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| self.matches(pattern, host))
            .map(String::as_str)
    }

    fn matches(&self, pattern: &str, host: &str) -> bool {
        match self.mode {
            MatchMode::Substring => host.contains(pattern),
            MatchMode::Suffix => {
                let pattern = pattern.trim_start_matches('.');
                let host = host.trim_end_matches('.');
                if host.len() < pattern.len() {
                    return false;
                }
                let split = host.len() - pattern.len();
                host.is_char_boundary(split)
                    && host[split..].eq_ignore_ascii_case(pattern)
                    && (split == 0 || host.as_bytes()[split - 1] == b'.')
            }
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
