//! The proxy-aware transport callers inject in place of the default one

use std::sync::Arc;

use super::interceptor::HttpInterceptor;
use super::tunnel::TunnelNegotiator;
use super::Route;
use crate::config::{Config, ProxySettings};
use crate::error::Result;
use crate::request::{OutboundRequest, Scheme};
use crate::transport::{HttpTransport, RequestHandle, ResponseCallback, Transport};

/// Decorates [`HttpTransport`] with proxy routing.
///
/// Implements the same [`Transport`] capability, so call sites do not change.
/// Schemes without a configured proxy pass straight through.
#[derive(Clone)]
pub struct ProxyAgent {
    settings: Arc<ProxySettings>,
    direct: HttpTransport,
    http: HttpInterceptor,
    https: TunnelNegotiator,
}

impl ProxyAgent {
    pub fn new(settings: ProxySettings, transport: HttpTransport) -> Self {
        let settings = Arc::new(settings);
        Self {
            http: HttpInterceptor::new(settings.clone(), transport.clone()),
            https: TunnelNegotiator::new(settings.clone(), transport.clone()),
            direct: transport,
            settings,
        }
    }

    /// Agent for a loaded configuration, trusting its extra TLS roots
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            ProxySettings::from_config(config),
            HttpTransport::from_config(config)?,
        ))
    }

    /// Agent configured from the process environment
    pub fn from_env() -> Self {
        Self::new(ProxySettings::from_env(), HttpTransport::new())
    }

    /// Log routing decisions at info instead of debug
    pub fn with_decision_logging(mut self, enabled: bool) -> Self {
        self.http = self.http.with_decision_logging(enabled);
        self.https = self.https.with_decision_logging(enabled);
        self
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// How a call to `host` over `scheme` would be routed
    pub fn route(&self, scheme: Scheme, host: &str) -> Route {
        if self.settings.is_enabled(scheme) && self.settings.is_proxy_required(host) {
            Route::Proxied
        } else {
            Route::Direct
        }
    }
}

impl Transport for ProxyAgent {
    fn request(
        &self,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<Box<dyn RequestHandle>> {
        if !self.settings.is_enabled(request.scheme) {
            return self.direct.request(request, on_response);
        }
        match request.scheme {
            Scheme::Http => self.http.request(request, on_response),
            Scheme::Https => self.https.request(request, on_response),
        }
    }
}
