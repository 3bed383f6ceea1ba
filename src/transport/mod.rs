//! The default, un-intercepted outbound transport

mod client;
mod handle;

pub use client::{ClientRequest, Io};
pub use handle::{
    Command, Dispatch, EventKind, Listener, RequestEvent, RequestHandle, RequestHandleExt,
    ResponseCallback,
};

pub(crate) use client::{Dial, Driver, TlsTarget};
pub(crate) use handle::Emitter;

use rustls::ClientConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::OutboundRequest;

/// The outbound-call capability.
///
/// [`HttpTransport`] talks to destinations directly; [`ProxyAgent`](crate::ProxyAgent)
/// decorates it with proxy routing. Callers pick one and never see the difference.
pub trait Transport: Send + Sync {
    /// Issue a request. The returned handle accepts body writes and control
    /// operations right away; `on_response` receives the response.
    ///
    /// Must be called within a Tokio runtime.
    fn request(
        &self,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<Box<dyn RequestHandle>>;
}

/// Direct HTTP/1.1 client over TCP, with rustls for `https`.
///
/// Every request gets its own connection; nothing is pooled.
#[derive(Clone)]
pub struct HttpTransport {
    tls_config: Arc<ClientConfig>,
}

impl HttpTransport {
    /// Transport trusting the bundled webpki roots
    pub fn new() -> Self {
        Self::with_tls_config(Arc::new(client_tls_config(root_store())))
    }

    /// Transport with a caller-provided TLS configuration
    pub fn with_tls_config(tls_config: Arc<ClientConfig>) -> Self {
        Self { tls_config }
    }

    /// Transport trusting webpki roots plus the `proxy.tls_ca` bundle, if configured
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut roots = root_store();
        if let Some(ref path) = config.proxy.tls_ca {
            add_pem_roots(&mut roots, path)?;
        }
        Ok(Self::with_tls_config(Arc::new(client_tls_config(roots))))
    }

    /// Send a request straight to its destination
    pub fn send(
        &self,
        mut request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<ClientRequest> {
        request.ensure_host_header(&request.host_header())?;

        let tls = request.scheme.is_secure().then(|| TlsTarget {
            config: self.tls_config.clone(),
            server_name: request.host.clone(),
        });
        let dial = Dial::Tcp {
            host: request.host.clone(),
            port: request.effective_port(),
            tls,
        };

        tracing::trace!(
            method = %request.method,
            host = %request.host,
            port = request.effective_port(),
            path = %request.path,
            "Sending request"
        );
        ClientRequest::spawn(dial, request, on_response)
    }

    /// Send a secure request over an already established raw channel.
    ///
    /// The channel is owned by this one request and closed with it.
    pub fn send_over<S: Io>(
        &self,
        channel: S,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<ClientRequest> {
        let (handle, driver) = self.prepare_over(channel, request, on_response)?;
        driver.start();
        Ok(handle)
    }

    /// Like [`send_over`](Self::send_over), but the exchange waits for the driver to start
    pub(crate) fn prepare_over<S: Io>(
        &self,
        channel: S,
        mut request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<(ClientRequest, Driver)> {
        request.ensure_host_header(&request.host_header())?;

        let dial = Dial::Channel {
            io: Box::new(channel),
            tls: TlsTarget {
                config: self.tls_config.clone(),
                server_name: request.host.clone(),
            },
        };
        ClientRequest::prepare(dial, request, on_response)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn request(
        &self,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<Box<dyn RequestHandle>> {
        Ok(Box::new(self.send(request, on_response)?))
    }
}

fn root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Uses the process-wide crypto provider: the one the binary installs at
/// startup, or the crate's `aws_lc_rs` provider otherwise.
fn client_tls_config(roots: rustls::RootCertStore) -> ClientConfig {
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

fn add_pem_roots(roots: &mut rustls::RootCertStore, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let pem = std::fs::read(path).map_err(|e| {
        Error::config(format!(
            "Failed to read TLS CA bundle '{}': {}",
            path.display(),
            e
        ))
    })?;

    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut BufReader::new(&pem[..])) {
        let cert = cert.map_err(|e| Error::tls(format!("Invalid PEM in '{}': {}", path.display(), e)))?;
        roots
            .add(cert)
            .map_err(|e| Error::tls(format!("Rejected CA in '{}': {}", path.display(), e)))?;
        added += 1;
    }

    if added == 0 {
        return Err(Error::config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }
    tracing::debug!(path = %path.display(), certificates = added, "Loaded extra TLS roots");
    Ok(())
}
