//! Caller-supplied description of an outbound call

use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{HeaderMap, Method, Uri};
use std::borrow::Cow;
use std::fmt;

use crate::error::{Error, Result};

/// Schemes the transport speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("http") {
            Some(Scheme::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Some(Scheme::Https)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host as dialed: an IPv6 literal without its brackets
pub(crate) fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Host as written in an authority: IPv6 literals are bracketed
pub(crate) fn authority_host(host: &str) -> Cow<'_, str> {
    if host.contains(':') {
        Cow::Owned(format!("[{}]", host))
    } else {
        Cow::Borrowed(host)
    }
}

/// An outbound request as the caller describes it.
///
/// Interceptors never mutate a caller's value; rewrites work on a clone.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub scheme: Scheme,
    /// Hostname or IP address; IPv6 literals are stored without brackets
    pub host: String,
    /// Explicit port; `None` means the scheme's default
    pub port: Option<u16>,
    /// Request target: origin-form (`/v1/x?q=1`) or, once rewritten for a proxy, absolute-form
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
}

impl OutboundRequest {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            scheme,
            host: bare_host(&host).to_string(),
            port: None,
            path: "/".to_string(),
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }

    /// Build a request from an absolute `http://` or `https://` URL
    pub fn from_url(method: Method, url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::invalid_url(format!("'{}': {}", url, e)))?;

        let scheme = uri
            .scheme_str()
            .and_then(Scheme::parse)
            .ok_or_else(|| Error::invalid_url(format!("'{}': expected http or https", url)))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::invalid_url(format!("'{}': missing host", url)))?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");

        Ok(Self {
            port: uri.port_u16(),
            path: path.to_string(),
            method,
            ..Self::new(scheme, host)
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::from_url(Method::GET, url)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// The port actually dialed
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(self.scheme.default_port())
    }

    /// `host:port` with the port always present, as used in CONNECT targets
    pub fn authority(&self) -> String {
        format!("{}:{}", authority_host(&self.host), self.effective_port())
    }

    /// Value for the `Host` header: the port is omitted when it is the scheme default
    pub fn host_header(&self) -> String {
        match self.port {
            Some(port) if port != self.scheme.default_port() => {
                format!("{}:{}", authority_host(&self.host), port)
            }
            _ => authority_host(&self.host).into_owned(),
        }
    }

    /// Absolute-form URI for relaying through a forward proxy.
    ///
    /// The port is always spelled out, defaulting to 80.
    pub fn absolute_uri(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme,
            authority_host(&self.host),
            self.port.unwrap_or(80),
            self.path
        )
    }

    /// Ensure a `Host` header is present, using `authority` when the caller set none
    pub(crate) fn ensure_host_header(&mut self, authority: &str) -> Result<()> {
        if !self.headers.contains_key(HOST) {
            let value = HeaderValue::from_str(authority)
                .map_err(|e| Error::invalid_url(format!("Invalid host '{}': {}", authority, e)))?;
            self.headers.insert(HOST, value);
        }
        Ok(())
    }
}
