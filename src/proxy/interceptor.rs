//! Plain HTTP interception: relay insecure calls through the forward proxy

use std::sync::Arc;

use super::{log_bypass, log_proxied};
use crate::config::{ProxyEndpoint, ProxySettings};
use crate::error::Result;
use crate::request::{OutboundRequest, Scheme};
use crate::transport::{ClientRequest, HttpTransport, RequestHandle, ResponseCallback, Transport};

/// Rewrite `request` into the absolute-form request a forward proxy expects.
///
/// Works on a clone. The target becomes `http://host:port/path` (port 80 when
/// unset) and the connection goes to `proxy`. The `Host` header keeps naming
/// the original destination.
pub fn proxied_request(request: &OutboundRequest, proxy: &ProxyEndpoint) -> Result<OutboundRequest> {
    let mut rewritten = request.clone();
    rewritten.ensure_host_header(&request.host_header())?;
    rewritten.path = request.absolute_uri();
    rewritten.scheme = proxy.scheme;
    rewritten.host = proxy.host.clone();
    rewritten.port = Some(proxy.port);
    Ok(rewritten)
}

/// Routes `http` calls through the plain proxy.
///
/// No tunnel is involved, so the caller gets the real request handle directly.
#[derive(Clone)]
pub struct HttpInterceptor {
    settings: Arc<ProxySettings>,
    transport: HttpTransport,
    log_decisions: bool,
}

impl HttpInterceptor {
    pub fn new(settings: Arc<ProxySettings>, transport: HttpTransport) -> Self {
        Self {
            settings,
            transport,
            log_decisions: false,
        }
    }

    /// Log routing decisions at info instead of debug
    pub fn with_decision_logging(mut self, enabled: bool) -> Self {
        self.log_decisions = enabled;
        self
    }

    /// Issue `request`, through the proxy unless its host is excluded.
    ///
    /// The proxy's own scheme picks the transport: TLS to the proxy when it
    /// is an `https://` address.
    pub fn send(
        &self,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<ClientRequest> {
        if !self.settings.is_proxy_required(&request.host) {
            log_bypass(self.log_decisions, &request);
            return self.transport.send(request, on_response);
        }

        match self.settings.endpoint(Scheme::Http)? {
            Some(endpoint) => {
                log_proxied(self.log_decisions, &request, endpoint);
                let rewritten = proxied_request(&request, endpoint)?;
                self.transport.send(rewritten, on_response)
            }
            None => self.transport.send(request, on_response),
        }
    }
}

impl Transport for HttpInterceptor {
    fn request(
        &self,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<Box<dyn RequestHandle>> {
        Ok(Box::new(self.send(request, on_response)?))
    }
}
