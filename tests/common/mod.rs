//! Test infrastructure for proxy routing tests.
#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use proxyhop::{
    EventKind, HttpTransport, RequestEvent, RequestHandle, RequestHandleExt, ResponseCallback,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tokio_rustls::TlsAcceptor;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

// ---------------------------------------------------------------------------
// RecordingProxy: a forward proxy that remembers what it was asked
// ---------------------------------------------------------------------------

/// One request as the proxy saw it
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub method: String,
    /// Request target as sent: absolute-form for relays, authority-form for CONNECT
    pub target: String,
    pub host: Option<String>,
}

/// A forward proxy on localhost.
///
/// Relays absolute-form requests and opens CONNECT tunnels, unless started
/// with [`RecordingProxy::rejecting`].
pub struct RecordingProxy {
    pub addr: SocketAddr,
    /// Set when the proxy itself speaks TLS
    identity: Option<CertificateDer<'static>>,
    seen: Arc<Mutex<Vec<Seen>>>,
    shutdown_tx: oneshot::Sender<()>,
}

impl RecordingProxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::spawn(listener, None, None)
    }

    /// A proxy that answers every request with `status`
    pub async fn rejecting(status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::spawn(listener, Some(status), None)
    }

    /// A proxy behind TLS with a self-signed `localhost` certificate
    pub async fn start_tls() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::spawn(listener, None, Some(LocalhostIdentity::generate()))
    }

    /// A proxy on the IPv6 loopback, or `None` when the host has no IPv6
    pub async fn start_ipv6() -> Option<Self> {
        let listener = TcpListener::bind("[::1]:0").await.ok()?;
        Some(Self::spawn(listener, None, None))
    }

    fn spawn(
        listener: TcpListener,
        reject: Option<StatusCode>,
        identity: Option<LocalhostIdentity>,
    ) -> Self {
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let cert_der = identity.as_ref().map(|id| id.cert_der.clone());
        let acceptor = identity.map(LocalhostIdentity::acceptor);

        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        let log = log.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => {
                                    let Ok(tls) = acceptor.accept(stream).await else { return };
                                    serve_proxy(tls, log, reject).await;
                                }
                                None => serve_proxy(stream, log, reject).await,
                            }
                        });
                    }
                }
            }
        });

        Self {
            addr,
            identity: cert_der,
            seen,
            shutdown_tx,
        }
    }

    /// Address in the form the proxy settings expect
    pub fn url(&self) -> String {
        match self.identity {
            Some(_) => format!("https://localhost:{}", self.addr.port()),
            None => format!("http://{}", self.addr),
        }
    }

    /// A transport that trusts this proxy's certificate
    pub fn transport(&self) -> HttpTransport {
        let cert = self.identity.clone().expect("proxy was not started with TLS");
        HttpTransport::with_tls_config(client_config_trusting(cert))
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn serve_proxy<S>(io: S, log: Arc<Mutex<Vec<Seen>>>, reject: Option<StatusCode>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| proxy_request(req, log.clone(), reject));
    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await;
}

async fn proxy_request(
    req: Request<Incoming>,
    log: Arc<Mutex<Vec<Seen>>>,
    reject: Option<StatusCode>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    log.lock().unwrap().push(Seen {
        method: req.method().to_string(),
        target: req.uri().to_string(),
        host: req
            .headers()
            .get(hyper::header::HOST)
            .map(|v| v.to_str().unwrap().to_string()),
    });

    if let Some(status) = reject {
        return Ok(Response::builder()
            .status(status)
            .body(full("denied by test proxy"))
            .unwrap());
    }

    if req.method() == Method::CONNECT {
        let target = req.uri().authority().unwrap().to_string();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    eprintln!("test proxy upgrade failed: {}", e);
                    return;
                }
            };
            let Ok(mut server) = TcpStream::connect(&target).await else {
                return;
            };
            let mut client = TokioIo::new(upgraded);
            let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
        });
        return Ok(Response::new(empty()));
    }

    relay(req).await
}

/// Forward an absolute-form request to its origin in origin-form
async fn relay(req: Request<Incoming>) -> Result<Response<ProxyBody>, hyper::Error> {
    let authority = req.uri().authority().unwrap().to_string();
    let stream = TcpStream::connect(&authority).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(conn);

    let (mut parts, body) = req.into_parts();
    parts.uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap();
    let resp = sender.send_request(Request::from_parts(parts, body)).await?;
    Ok(resp.map(|body| body.boxed()))
}

// ---------------------------------------------------------------------------
// TlsUpstream: an HTTPS origin with a self-signed localhost certificate
// ---------------------------------------------------------------------------

/// A self-signed certificate and key for `localhost`
struct LocalhostIdentity {
    cert_der: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

impl LocalhostIdentity {
    fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            cert_der: generated.cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                generated.key_pair.serialize_der(),
            )),
        }
    }

    fn acceptor(self) -> TlsAcceptor {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der], self.key)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Client TLS configuration trusting only `cert`
fn client_config_trusting(cert: CertificateDer<'static>) -> Arc<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// An HTTPS server for `localhost` that echoes each request.
///
/// The response body is `<name> <METHOD> <path> host=<Host> body=<request body>`.
pub struct TlsUpstream {
    pub addr: SocketAddr,
    cert_der: CertificateDer<'static>,
    shutdown_tx: oneshot::Sender<()>,
}

impl TlsUpstream {
    pub async fn start(name: &'static str) -> Self {
        let identity = LocalhostIdentity::generate();
        let cert_der = identity.cert_der.clone();
        let acceptor = identity.acceptor();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { continue };
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let Ok(tls) = acceptor.accept(stream).await else { return };
                            let service = service_fn(move |req| echo(name, req));
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(tls), service)
                                .await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            cert_der,
            shutdown_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.port(), path)
    }

    /// Client TLS configuration trusting only this server's certificate
    pub fn client_tls_config(&self) -> Arc<ClientConfig> {
        client_config_trusting(self.cert_der.clone())
    }

    /// A transport that trusts this server
    pub fn transport(&self) -> HttpTransport {
        HttpTransport::with_tls_config(self.client_tls_config())
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn echo(name: &'static str, req: Request<Incoming>) -> Result<Response<ProxyBody>, hyper::Error> {
    let method = req.method().to_string();
    let path = req.uri().to_string();
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = req.into_body().collect().await?.to_bytes();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(full(format!(
            "{} {} {} host={} body={}",
            name,
            method,
            path,
            host,
            String::from_utf8_lossy(&body)
        )))
        .unwrap())
}

// ---------------------------------------------------------------------------
// Call observation
// ---------------------------------------------------------------------------

/// Everything one call reported: its events, and its response once it arrives.
pub struct CallLog {
    events: Arc<Mutex<Vec<RequestEvent>>>,
    closed: Arc<Notify>,
    response: Option<oneshot::Receiver<Response<Incoming>>>,
}

/// A response callback paired with the receiver `CallLog` waits on
pub fn response_slot() -> (ResponseCallback, oneshot::Receiver<Response<Incoming>>) {
    let (tx, rx) = oneshot::channel();
    let callback: ResponseCallback = Box::new(move |resp| {
        let _ = tx.send(resp);
    });
    (callback, rx)
}

impl CallLog {
    /// Subscribe to every event kind on `handle`
    pub fn attach(
        handle: &mut dyn RequestHandle,
        response: Option<oneshot::Receiver<Response<Incoming>>>,
    ) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Notify::new());

        for kind in [
            EventKind::Response,
            EventKind::Timeout,
            EventKind::Abort,
            EventKind::Error,
            EventKind::Close,
        ] {
            let events = events.clone();
            let closed = closed.clone();
            handle.on(kind, move |event| {
                events.lock().unwrap().push(event.clone());
                if event.kind() == EventKind::Close {
                    closed.notify_one();
                }
            });
        }

        Self {
            events,
            closed,
            response,
        }
    }

    /// Wait for the close event
    pub async fn closed(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.closed.notified())
            .await
            .expect("call did not close in time");
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }

    /// Message of the first error event, if any
    pub fn error(&self) -> Option<String> {
        self.events.lock().unwrap().iter().find_map(|e| match e {
            RequestEvent::Error(err) => Some(err.to_string()),
            _ => None,
        })
    }

    /// Status and body of the response
    pub async fn response(&mut self) -> (StatusCode, String) {
        let rx = self.response.take().expect("no response receiver attached");
        let resp = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("no response in time")
            .expect("response callback dropped");
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }
}

/// A port with nothing listening on it
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// LogCapture: collects formatted tracing output for assertions
// ---------------------------------------------------------------------------

/// Formatted log output of the current thread.
///
/// Tokio tests default to a current-thread runtime, so spawned tasks log here too.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Capture events at `level` and above until the guard drops
    pub fn install(level: &str) -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(level))
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).to_string()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
