//! Configuration parsing and startup resolution of proxy endpoints

use hyper::Uri;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::filter::{ExclusionList, MatchMode};
use crate::request::{authority_host, bare_host, Scheme};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy addresses and exclusions, as written in the config file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Proxy for plain `http` calls (`scheme://host[:port]`)
    #[serde(default)]
    pub http_proxy: Option<String>,

    /// Proxy for `https` calls, reached with CONNECT
    #[serde(default)]
    pub https_proxy: Option<String>,

    /// Hosts that bypass the proxy. Accepts a comma-separated string or an array.
    #[serde(default, deserialize_with = "deserialize_no_proxy")]
    pub no_proxy: Option<Vec<String>>,

    /// How exclusion patterns are compared against hosts
    #[serde(default)]
    pub no_proxy_mode: MatchMode,

    /// Path to a PEM bundle of extra roots for the secure transport
    #[serde(default)]
    pub tls_ca: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log each proxy/bypass decision
    #[serde(default = "default_true")]
    pub log_decisions: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_decisions: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Helper for deserializing `no_proxy` as either a string or an array.
#[derive(Deserialize)]
#[serde(untagged)]
enum NoProxyValue {
    List(Vec<String>),
    Csv(String),
}

fn deserialize_no_proxy<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<NoProxyValue>::deserialize(deserializer)?;
    Ok(raw.map(|value| match value {
        NoProxyValue::List(patterns) => patterns,
        NoProxyValue::Csv(csv) => ExclusionList::split(&csv),
    }))
}

/// Environment variables consulted, lowercase first (curl convention).
const HTTP_PROXY_VARS: [&str; 2] = ["http_proxy", "HTTP_PROXY"];
const HTTPS_PROXY_VARS: [&str; 2] = ["https_proxy", "HTTPS_PROXY"];
const NO_PROXY_VARS: [&str; 2] = ["no_proxy", "NO_PROXY"];

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))
    }

    /// Build a configuration from the process environment
    pub fn from_env() -> Self {
        Self::default().with_env_lookup(|name| std::env::var(name).ok())
    }

    /// Fill proxy settings the file left unset from the process environment
    pub fn with_env_overrides(self) -> Self {
        self.with_env_lookup(|name| std::env::var(name).ok())
    }

    /// Fill unset proxy settings from an arbitrary variable lookup.
    ///
    /// Empty values count as unset.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .find(|value| !value.trim().is_empty())
        };

        if self.proxy.http_proxy.is_none() {
            self.proxy.http_proxy = first(&HTTP_PROXY_VARS);
        }
        if self.proxy.https_proxy.is_none() {
            self.proxy.https_proxy = first(&HTTPS_PROXY_VARS);
        }
        if self.proxy.no_proxy.is_none() {
            self.proxy.no_proxy = first(&NO_PROXY_VARS).map(|csv| ExclusionList::split(&csv));
        }
        self
    }
}

/// A parsed proxy address. Never changes once resolved at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub scheme: Scheme,
    /// IPv6 literals are stored without brackets
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    /// Parse a `scheme://host[:port]` address. A missing port defaults to the scheme's port.
    pub fn parse(address: &str) -> Result<Self> {
        let uri: Uri = address
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid proxy address '{}': {}", address, e)))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::config(format!("Proxy address '{}' has no scheme", address)))
            .and_then(|s| {
                Scheme::parse(s).ok_or_else(|| {
                    Error::config(format!("Unsupported proxy scheme '{}' in '{}'", s, address))
                })
            })?;

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config(format!("Proxy address '{}' has no host", address)))?;

        Ok(Self {
            scheme,
            host: bare_host(host).to_string(),
            port: uri.port_u16().unwrap_or(scheme.default_port()),
        })
    }

    /// `host:port` form used to dial the proxy
    pub fn authority(&self) -> String {
        format!("{}:{}", authority_host(&self.host), self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}",
            self.scheme,
            authority_host(&self.host),
            self.port
        )
    }
}

/// Outcome of parsing one configured address.
///
/// Kept as-is so a malformed address fails the first call that needs it.
#[derive(Debug, Clone)]
enum EndpointSetting {
    Parsed(ProxyEndpoint),
    Malformed(String),
}

impl EndpointSetting {
    fn resolve(address: &str) -> Self {
        match ProxyEndpoint::parse(address) {
            Ok(endpoint) => EndpointSetting::Parsed(endpoint),
            Err(e) => EndpointSetting::Malformed(e.to_string()),
        }
    }
}

/// Process-wide proxy settings, resolved once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    http: Option<EndpointSetting>,
    https: Option<EndpointSetting>,
    exclusions: ExclusionList,
}

impl ProxySettings {
    /// Resolve endpoints and exclusions from configuration
    pub fn from_config(config: &Config) -> Self {
        let proxy = &config.proxy;
        let exclusions = match &proxy.no_proxy {
            Some(patterns) => ExclusionList::new(patterns.clone(), proxy.no_proxy_mode),
            None => ExclusionList::none(),
        };

        Self {
            http: proxy.http_proxy.as_deref().map(EndpointSetting::resolve),
            https: proxy.https_proxy.as_deref().map(EndpointSetting::resolve),
            exclusions,
        }
    }

    /// Resolve settings from the process environment
    pub fn from_env() -> Self {
        Self::from_config(&Config::from_env())
    }

    /// Settings that never intercept anything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether calls of this scheme are intercepted at all
    pub fn is_enabled(&self, scheme: Scheme) -> bool {
        self.setting(scheme).is_some()
    }

    /// The endpoint for a scheme: `Ok(None)` when disabled, `Err` when the address was malformed.
    pub fn endpoint(&self, scheme: Scheme) -> Result<Option<&ProxyEndpoint>> {
        match self.setting(scheme) {
            None => Ok(None),
            Some(EndpointSetting::Parsed(endpoint)) => Ok(Some(endpoint)),
            Some(EndpointSetting::Malformed(msg)) => Err(Error::config(msg.clone())),
        }
    }

    pub fn exclusions(&self) -> &ExclusionList {
        &self.exclusions
    }

    /// Shorthand for the exclusion decision
    pub fn is_proxy_required(&self, host: &str) -> bool {
        self.exclusions.is_proxy_required(host)
    }

    fn setting(&self, scheme: Scheme) -> Option<&EndpointSetting> {
        match scheme {
            Scheme::Http => self.http.as_ref(),
            Scheme::Https => self.https.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[proxy]
http_proxy = "http://proxy.local:8080"
https_proxy = "http://proxy.local:3128"
no_proxy = "internal.,10.0."

[logging]
level = "debug"
log_decisions = false
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(
            config.proxy.http_proxy.as_deref(),
            Some("http://proxy.local:8080")
        );
        assert_eq!(
            config.proxy.https_proxy.as_deref(),
            Some("http://proxy.local:3128")
        );
        assert_eq!(
            config.proxy.no_proxy,
            Some(vec!["internal.".to_string(), "10.0.".to_string()])
        );
        assert_eq!(config.proxy.no_proxy_mode, MatchMode::Substring);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.log_decisions);
    }

    #[test]
    fn test_no_proxy_as_array() {
        let toml = r#"
[proxy]
no_proxy = ["localhost", "example.org"]
no_proxy_mode = "suffix"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(
            config.proxy.no_proxy,
            Some(vec!["localhost".to_string(), "example.org".to_string()])
        );
        assert_eq!(config.proxy.no_proxy_mode, MatchMode::Suffix);
    }

    #[test]
    fn test_default_values() {
        let config = Config::parse("").unwrap();
        assert!(config.proxy.http_proxy.is_none());
        assert!(config.proxy.https_proxy.is_none());
        assert!(config.proxy.no_proxy.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.log_decisions);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(Config::parse("this is not valid toml [[[").is_err());
    }

    #[test]
    fn test_env_lookup_prefers_lowercase() {
        let config = Config::default().with_env_lookup(env(&[
            ("http_proxy", "http://lower:1"),
            ("HTTP_PROXY", "http://upper:2"),
            ("HTTPS_PROXY", "http://upper:3"),
            ("no_proxy", "a.com, b.com"),
        ]));
        assert_eq!(config.proxy.http_proxy.as_deref(), Some("http://lower:1"));
        assert_eq!(config.proxy.https_proxy.as_deref(), Some("http://upper:3"));
        assert_eq!(
            config.proxy.no_proxy,
            Some(vec!["a.com".to_string(), "b.com".to_string()])
        );
    }

    #[test]
    fn test_env_does_not_override_file() {
        let config = Config::parse("[proxy]\nhttp_proxy = \"http://file:1\"\n")
            .unwrap()
            .with_env_lookup(env(&[("http_proxy", "http://env:2")]));
        assert_eq!(config.proxy.http_proxy.as_deref(), Some("http://file:1"));
    }

    #[test]
    fn test_empty_env_value_is_unset() {
        let config = Config::default().with_env_lookup(env(&[
            ("https_proxy", ""),
            ("HTTPS_PROXY", "http://upper:3128"),
        ]));
        assert_eq!(
            config.proxy.https_proxy.as_deref(),
            Some("http://upper:3128")
        );
    }

    #[test]
    fn test_endpoint_parse_with_port() {
        let endpoint = ProxyEndpoint::parse("http://proxy.local:8080").unwrap();
        assert_eq!(endpoint.scheme, Scheme::Http);
        assert_eq!(endpoint.host, "proxy.local");
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.authority(), "proxy.local:8080");
    }

    #[test]
    fn test_endpoint_parse_ipv6_literal() {
        let endpoint = ProxyEndpoint::parse("http://[::1]:3128").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 3128);
        assert_eq!(endpoint.authority(), "[::1]:3128");
        assert_eq!(endpoint.to_string(), "http://[::1]:3128");

        let secure = ProxyEndpoint::parse("https://[fe80::1]").unwrap();
        assert_eq!(secure.host, "fe80::1");
        assert_eq!(secure.authority(), "[fe80::1]:443");
    }

    #[test]
    fn test_endpoint_default_ports() {
        assert_eq!(ProxyEndpoint::parse("http://proxy").unwrap().port, 80);
        let secure = ProxyEndpoint::parse("https://proxy").unwrap();
        assert_eq!(secure.scheme, Scheme::Https);
        assert_eq!(secure.port, 443);
    }

    #[test]
    fn test_endpoint_rejects_unsupported_scheme() {
        let err = ProxyEndpoint::parse("socks5://proxy:1080").unwrap_err();
        assert!(err.to_string().contains("Unsupported proxy scheme"));
    }

    #[test]
    fn test_endpoint_rejects_missing_scheme() {
        assert!(ProxyEndpoint::parse("proxy.local:8080").is_err());
    }

    #[test]
    fn test_settings_disabled_scheme() {
        let settings = ProxySettings::disabled();
        assert!(!settings.is_enabled(Scheme::Http));
        assert!(settings.endpoint(Scheme::Https).unwrap().is_none());
        assert!(settings.is_proxy_required("anything"));
    }

    #[test]
    fn test_malformed_address_surfaces_at_use() {
        let config = Config::parse("[proxy]\nhttps_proxy = \"::not a url::\"\n").unwrap();
        let settings = ProxySettings::from_config(&config);
        assert!(settings.is_enabled(Scheme::Https));
        let err = settings.endpoint(Scheme::Https).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(settings.endpoint(Scheme::Http).unwrap().is_none());
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::parse(
            r#"
[proxy]
http_proxy = "http://proxy.local:8080"
no_proxy = "internal."
"#,
        )
        .unwrap();
        let settings = ProxySettings::from_config(&config);
        let endpoint = settings.endpoint(Scheme::Http).unwrap().unwrap();
        assert_eq!(endpoint.to_string(), "http://proxy.local:8080");
        assert!(!settings.is_proxy_required("api.internal.example.com"));
        assert!(settings.is_proxy_required("example.com"));
    }
}
