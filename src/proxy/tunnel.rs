//! CONNECT tunnel negotiation for secure calls

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::HOST;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;

use super::deferred::TunnelSession;
use super::{log_bypass, log_proxied};
use crate::config::{ProxyEndpoint, ProxySettings};
use crate::error::{Error, Result};
use crate::request::{OutboundRequest, Scheme};
use crate::transport::{HttpTransport, RequestHandle, ResponseCallback, Transport};

/// Routes `https` calls through a CONNECT tunnel on the secure proxy.
///
/// The caller gets a [`DeferredRequest`](super::DeferredRequest) right away;
/// the tunnel is negotiated on a spawned task and the real request runs over
/// it once the proxy acknowledges.
#[derive(Clone)]
pub struct TunnelNegotiator {
    settings: Arc<ProxySettings>,
    transport: HttpTransport,
    log_decisions: bool,
}

impl TunnelNegotiator {
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

    /// Issue `request`, tunneling it through the proxy unless its host is excluded.
    ///
    /// Must be called within a Tokio runtime.
    pub fn send(
        &self,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<Box<dyn RequestHandle>> {
        if !self.settings.is_proxy_required(&request.host) {
            log_bypass(self.log_decisions, &request);
            return Ok(Box::new(self.transport.send(request, on_response)?));
        }

        let Some(endpoint) = self.settings.endpoint(Scheme::Https)?.cloned() else {
            return Ok(Box::new(self.transport.send(request, on_response)?));
        };
        log_proxied(self.log_decisions, &request, &endpoint);

        let (session, placeholder) = TunnelSession::open(request.authority());
        tokio::spawn(negotiate(
            session,
            endpoint,
            self.transport.clone(),
            request,
            on_response,
        ));
        Ok(Box::new(placeholder))
    }
}

impl Transport for TunnelNegotiator {
    fn request(
        &self,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<Box<dyn RequestHandle>> {
        self.send(request, on_response)
    }
}

/// Establish the tunnel, then run the caller's request over it and resolve the session.
async fn negotiate(
    session: TunnelSession,
    endpoint: ProxyEndpoint,
    transport: HttpTransport,
    request: OutboundRequest,
    on_response: Option<ResponseCallback>,
) {
    let target = session.target().to_string();

    let upgraded = match open_tunnel(&endpoint, &target).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::warn!(
                target = %target,
                proxy = %endpoint,
                error = %e,
                "Tunnel establishment failed"
            );
            let _ = session.fail(e);
            return;
        }
    };

    tracing::debug!(target = %target, proxy = %endpoint, "Tunnel established");
    // Replay before the exchange starts so queued listeners see every event
    let resolved = match transport.prepare_over(TokioIo::new(upgraded), request, on_response) {
        Ok((handle, driver)) => {
            let resolved = session.connect(Box::new(handle));
            driver.start();
            resolved
        }
        Err(e) => session.fail(e),
    };
    if let Err(e) = resolved {
        tracing::error!(target = %target, error = %e, "Failed to resolve tunneled request");
    }
}

/// Send CONNECT for `target` to the proxy and take over the connection once it agrees.
///
/// The proxy is always dialed over plain TCP.
async fn open_tunnel(endpoint: &ProxyEndpoint, target: &str) -> Result<Upgraded> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| Error::proxy(format!("Failed to connect to proxy {}: {}", endpoint, e)))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(error = %e, "Proxy connection error");
        }
    });

    let resp = sender
        .send_request(connect_request(target)?)
        .await
        .map_err(|e| Error::proxy(format!("CONNECT {} via {} failed: {}", target, endpoint, e)))?;

    if !resp.status().is_success() {
        return Err(Error::tunnel_rejected(target, resp.status()));
    }

    hyper::upgrade::on(resp)
        .await
        .map_err(|e| Error::proxy(format!("Proxy did not hand over the tunnel: {}", e)))
}

/// `CONNECT host:port` with a matching `Host` header and no body
fn connect_request(target: &str) -> Result<Request<Empty<Bytes>>> {
    Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .header(HOST, target)
        .body(Empty::new())
        .map_err(|e| Error::invalid_url(format!("Invalid tunnel target '{}': {}", target, e)))
}
