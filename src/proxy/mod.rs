//! Proxy routing for outbound calls

mod agent;
mod deferred;
mod interceptor;
mod tunnel;

pub use agent::ProxyAgent;
pub use deferred::{DeferredRequest, SessionState, TunnelSession};
pub use interceptor::{proxied_request, HttpInterceptor};
pub use tunnel::TunnelNegotiator;

use std::fmt;

use crate::config::ProxyEndpoint;
use crate::request::OutboundRequest;

/// Routing decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxied,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Proxied => f.write_str("proxied"),
        }
    }
}

pub(crate) fn log_bypass(verbose: bool, request: &OutboundRequest) {
    if verbose {
        tracing::info!(scheme = %request.scheme, host = %request.host, "Bypassing proxy");
    } else {
        tracing::debug!(scheme = %request.scheme, host = %request.host, "Bypassing proxy");
    }
}

pub(crate) fn log_proxied(verbose: bool, request: &OutboundRequest, proxy: &ProxyEndpoint) {
    if verbose {
        tracing::info!(
            scheme = %request.scheme,
            host = %request.host,
            proxy = %proxy,
            "Routing through proxy"
        );
    } else {
        tracing::debug!(
            scheme = %request.scheme,
            host = %request.host,
            proxy = %proxy,
            "Routing through proxy"
        );
    }
}
