//! The real request handle: one HTTP/1.1 exchange over its own connection

use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::TlsConnector;

use super::handle::{
    Command, Dispatch, Emitter, RequestEvent, RequestHandle, ResponseCallback,
};
use crate::error::{Error, Result};
use crate::request::OutboundRequest;

/// A bidirectional byte stream a request can run over
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// TLS parameters for one connection
#[derive(Clone)]
pub(crate) struct TlsTarget {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) server_name: String,
}

/// How the request reaches its peer
pub(crate) enum Dial {
    /// Open a fresh TCP connection, optionally wrapped in TLS
    Tcp {
        host: String,
        port: u16,
        tls: Option<TlsTarget>,
    },
    /// Run TLS over a channel someone else established (a CONNECT tunnel)
    Channel { io: Box<dyn Io>, tls: TlsTarget },
}

/// Request body fed by `write` and closed by `end`
struct ChunkBody {
    chunks: mpsc::UnboundedReceiver<Bytes>,
}

impl Body for ChunkBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        self.chunks
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SocketOptions {
    no_delay: Option<bool>,
    keepalive: Option<(bool, Option<Duration>)>,
}

/// Socket options requested so far, and the socket once it exists
#[derive(Default)]
struct SocketSlot {
    pending: SocketOptions,
    socket: Option<socket2::Socket>,
}

impl SocketSlot {
    fn request(&mut self, options: SocketOptions) {
        if options.no_delay.is_some() {
            self.pending.no_delay = options.no_delay;
        }
        if options.keepalive.is_some() {
            self.pending.keepalive = options.keepalive;
        }
        self.apply();
    }

    fn attach(&mut self, socket: socket2::Socket) {
        self.socket = Some(socket);
        self.apply();
    }

    fn apply(&self) {
        let Some(socket) = &self.socket else {
            return;
        };
        if let Some(no_delay) = self.pending.no_delay {
            if let Err(e) = socket.set_nodelay(no_delay) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
        }
        if let Some((enable, initial_delay)) = self.pending.keepalive {
            let result = match (enable, initial_delay) {
                (true, Some(delay)) => {
                    socket.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(delay))
                }
                _ => socket.set_keepalive(enable),
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "Failed to set SO_KEEPALIVE");
            }
        }
    }
}

/// The exchange of a prepared request, not yet running
pub(crate) struct Driver(Pin<Box<dyn Future<Output = ()> + Send>>);

impl Driver {
    /// Run the exchange on a new task. Must be called within a Tokio runtime.
    pub(crate) fn start(self) {
        tokio::spawn(self.0);
    }
}

/// A live outbound request.
///
/// Created by [`HttpTransport`](super::HttpTransport). The exchange runs on a
/// spawned task; this handle streams the body and controls the call.
pub struct ClientRequest {
    body: Option<mpsc::UnboundedSender<Bytes>>,
    emitter: Emitter,
    abort: Option<oneshot::Sender<()>>,
    timeout: watch::Sender<Option<Duration>>,
    /// Absent when the request runs over a channel that is not our own TCP socket
    socket: Option<Arc<Mutex<SocketSlot>>>,
}

impl ClientRequest {
    /// Start the exchange on a new task. Must be called within a Tokio runtime.
    pub(crate) fn spawn(
        dial: Dial,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<Self> {
        let (handle, driver) = Self::prepare(dial, request, on_response)?;
        driver.start();
        Ok(handle)
    }

    /// Build the handle without starting the exchange.
    ///
    /// Commands dispatched before the driver starts are kept and take effect
    /// once it runs.
    pub(crate) fn prepare(
        dial: Dial,
        request: OutboundRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<(Self, Driver)> {
        let uri: Uri = request
            .path
            .parse()
            .map_err(|e| Error::invalid_url(format!("'{}': {}", request.path, e)))?;

        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let mut builder = Request::builder().method(request.method).uri(uri);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let req = builder
            .body(ChunkBody { chunks: body_rx })
            .map_err(|e| Error::invalid_url(format!("Failed to build request: {}", e)))?;

        let socket = match dial {
            Dial::Tcp { .. } => Some(Arc::new(Mutex::new(SocketSlot::default()))),
            Dial::Channel { .. } => None,
        };
        let emitter = Emitter::default();
        let (abort_tx, abort_rx) = oneshot::channel();
        let (timeout_tx, timeout_rx) = watch::channel(None);

        let driver = Driver(Box::pin(drive(
            dial,
            req,
            socket.clone(),
            emitter.clone(),
            on_response,
            abort_rx,
            timeout_rx,
        )));

        let handle = Self {
            body: Some(body_tx),
            emitter,
            abort: Some(abort_tx),
            timeout: timeout_tx,
            socket,
        };
        Ok((handle, driver))
    }

    fn set_socket_options(&self, options: SocketOptions) -> Dispatch {
        match &self.socket {
            Some(slot) => {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .request(options);
                Dispatch::Handled
            }
            None => Dispatch::Unsupported,
        }
    }
}

impl RequestHandle for ClientRequest {
    fn dispatch(&mut self, command: Command) -> Dispatch {
        match command {
            Command::On(kind, listener) => self.emitter.add(kind, listener),
            Command::Write(chunk) => match &self.body {
                Some(body) => {
                    // A closed receiver means the exchange is already over
                    let _ = body.send(chunk);
                }
                None => tracing::debug!("write after end ignored"),
            },
            Command::End => {
                self.body = None;
            }
            Command::Abort => {
                if let Some(abort) = self.abort.take() {
                    let _ = abort.send(());
                }
            }
            Command::SetTimeout(timeout) => {
                self.timeout.send_replace(Some(timeout));
            }
            Command::SetNoDelay(no_delay) => {
                return self.set_socket_options(SocketOptions {
                    no_delay: Some(no_delay),
                    ..Default::default()
                });
            }
            Command::SetKeepAlive {
                enable,
                initial_delay,
            } => {
                return self.set_socket_options(SocketOptions {
                    keepalive: Some((enable, initial_delay)),
                    ..Default::default()
                });
            }
        }
        Dispatch::Handled
    }
}

/// Resolves when the caller aborts; never resolves if the handle is dropped instead.
async fn aborted(signal: oneshot::Receiver<()>) {
    if signal.await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

/// Run one exchange to completion, reporting through the emitter.
async fn drive(
    dial: Dial,
    req: Request<ChunkBody>,
    socket: Option<Arc<Mutex<SocketSlot>>>,
    emitter: Emitter,
    on_response: Option<ResponseCallback>,
    abort: oneshot::Receiver<()>,
    mut timeout: watch::Receiver<Option<Duration>>,
) {
    let exchange = exchange(dial, req, socket);
    tokio::pin!(exchange);
    let abort = aborted(abort);
    tokio::pin!(abort);

    let mut timed_out = false;
    let mut timeout_live = true;

    loop {
        let idle = *timeout.borrow_and_update();
        tokio::select! {
            _ = &mut abort => {
                tracing::debug!("Request aborted");
                emitter.emit(&RequestEvent::Abort);
                break;
            }
            result = &mut exchange => {
                match result {
                    Ok(resp) => {
                        emitter.emit(&RequestEvent::Response {
                            status: resp.status(),
                            headers: resp.headers().clone(),
                        });
                        if let Some(callback) = on_response {
                            callback(resp);
                        }
                    }
                    Err(e) => emitter.emit_error(e),
                }
                break;
            }
            changed = timeout.changed(), if timeout_live => {
                // Re-arming the timer resets the idle deadline
                timeout_live = changed.is_ok();
                timed_out = false;
            }
            _ = sleep_for(idle), if !timed_out => {
                timed_out = true;
                emitter.emit(&RequestEvent::Timeout);
            }
        }
    }

    emitter.emit(&RequestEvent::Close);
}

async fn exchange(
    dial: Dial,
    req: Request<ChunkBody>,
    socket: Option<Arc<Mutex<SocketSlot>>>,
) -> Result<Response<Incoming>> {
    let io: Box<dyn Io> = match dial {
        Dial::Tcp { host, port, tls } => {
            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| {
                    std::io::Error::new(
                        e.kind(),
                        format!("Failed to connect to {}:{}: {}", host, port, e),
                    )
                })?;
            let tcp = match socket {
                Some(slot) => attach_socket(tcp, &slot)?,
                None => tcp,
            };
            match tls {
                Some(tls) => Box::new(connect_tls(tls, tcp).await?),
                None => Box::new(tcp),
            }
        }
        Dial::Channel { io, tls } => Box::new(connect_tls(tls, io).await?),
    };

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let err_str = e.to_string();
            if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                tracing::debug!(error = %e, "Connection error");
            }
        }
    });

    Ok(sender.send_request(req).await?)
}

/// Keep a duplicate of the socket so options can be changed after hyper owns the stream.
fn attach_socket(tcp: TcpStream, slot: &Mutex<SocketSlot>) -> Result<TcpStream> {
    let std_stream = tcp.into_std()?;
    let dup = socket2::Socket::from(std_stream.try_clone()?);
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .attach(dup);
    Ok(TcpStream::from_std(std_stream)?)
}

async fn connect_tls<S: Io>(
    tls: TlsTarget,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>> {
    let server_name = ServerName::try_from(tls.server_name.clone())
        .map_err(|e| Error::tls(format!("Invalid server name '{}': {}", tls.server_name, e)))?;

    TlsConnector::from(tls.config)
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls(format!("TLS connection to {} failed: {}", tls.server_name, e)))
}
