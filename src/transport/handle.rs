//! The operation surface shared by real and deferred request handles

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{HeaderMap, Response, StatusCode};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::Error;

/// Receives the response of a call, body included. Runs at most once.
pub type ResponseCallback = Box<dyn FnOnce(Response<Incoming>) + Send + 'static>;

/// Observes lifecycle events of a call
pub type Listener = Box<dyn FnMut(&RequestEvent) + Send + 'static>;

/// Event kinds a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Response,
    Timeout,
    Abort,
    Error,
    Close,
}

/// A lifecycle event of one outbound call
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// Response head received. The body goes to the [`ResponseCallback`].
    Response {
        status: StatusCode,
        headers: HeaderMap,
    },
    /// No response within the configured idle timeout. The call keeps running.
    Timeout,
    /// The call was aborted by the caller
    Abort,
    Error(Arc<Error>),
    /// The call is over; always the last event
    Close,
}

impl RequestEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RequestEvent::Response { .. } => EventKind::Response,
            RequestEvent::Timeout => EventKind::Timeout,
            RequestEvent::Abort => EventKind::Abort,
            RequestEvent::Error(_) => EventKind::Error,
            RequestEvent::Close => EventKind::Close,
        }
    }
}

/// One operation invoked on a request handle, with its arguments
pub enum Command {
    On(EventKind, Listener),
    Write(Bytes),
    End,
    Abort,
    SetTimeout(Duration),
    SetNoDelay(bool),
    SetKeepAlive {
        enable: bool,
        initial_delay: Option<Duration>,
    },
}

impl Command {
    /// Operation name, as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::On(..) => "on",
            Command::Write(_) => "write",
            Command::End => "end",
            Command::Abort => "abort",
            Command::SetTimeout(_) => "set_timeout",
            Command::SetNoDelay(_) => "set_no_delay",
            Command::SetKeepAlive { .. } => "set_keepalive",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::On(kind, _) => f.debug_tuple("On").field(kind).finish(),
            Command::Write(chunk) => f.debug_tuple("Write").field(chunk).finish(),
            Command::End => f.write_str("End"),
            Command::Abort => f.write_str("Abort"),
            Command::SetTimeout(d) => f.debug_tuple("SetTimeout").field(d).finish(),
            Command::SetNoDelay(b) => f.debug_tuple("SetNoDelay").field(b).finish(),
            Command::SetKeepAlive {
                enable,
                initial_delay,
            } => f
                .debug_struct("SetKeepAlive")
                .field("enable", enable)
                .field("initial_delay", initial_delay)
                .finish(),
        }
    }
}

/// Whether a handle carried out a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// The handle has no such capability; the command was dropped
    Unsupported,
}

/// A request handle: something commands can be dispatched to.
///
/// Use the chaining methods of [`RequestHandleExt`] rather than calling
/// `dispatch` directly.
pub trait RequestHandle: Send {
    fn dispatch(&mut self, command: Command) -> Dispatch;
}

impl<H: RequestHandle + ?Sized> RequestHandle for Box<H> {
    fn dispatch(&mut self, command: Command) -> Dispatch {
        (**self).dispatch(command)
    }
}

/// Chainable request operations, available on every [`RequestHandle`]
pub trait RequestHandleExt: RequestHandle {
    fn on<F>(&mut self, kind: EventKind, listener: F) -> &mut Self
    where
        F: FnMut(&RequestEvent) + Send + 'static,
    {
        self.dispatch(Command::On(kind, Box::new(listener)));
        self
    }

    fn write(&mut self, chunk: impl Into<Bytes>) -> &mut Self {
        self.dispatch(Command::Write(chunk.into()));
        self
    }

    fn end(&mut self) -> &mut Self {
        self.dispatch(Command::End);
        self
    }

    fn abort(&mut self) -> &mut Self {
        self.dispatch(Command::Abort);
        self
    }

    fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.dispatch(Command::SetTimeout(timeout));
        self
    }

    fn set_no_delay(&mut self, no_delay: bool) -> &mut Self {
        self.dispatch(Command::SetNoDelay(no_delay));
        self
    }

    fn set_keepalive(&mut self, enable: bool, initial_delay: Option<Duration>) -> &mut Self {
        self.dispatch(Command::SetKeepAlive {
            enable,
            initial_delay,
        });
        self
    }
}

impl<H: RequestHandle + ?Sized> RequestHandleExt for H {}

/// Listener registry for one call, shared between a handle and its driver.
///
/// Once the call has failed or closed, the registry remembers it: a listener
/// registered later for `Error` or `Close` is called right away instead of
/// waiting for an event that already happened.
#[derive(Clone, Default)]
pub(crate) struct Emitter {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    listeners: Vec<(EventKind, Listener)>,
    error: Option<Arc<Error>>,
    closed: bool,
}

impl Emitter {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, kind: EventKind, mut listener: Listener) {
        let late = {
            let mut registry = self.registry();
            match kind {
                EventKind::Error if registry.error.is_some() => {
                    registry.error.clone().map(RequestEvent::Error)
                }
                EventKind::Close if registry.closed => Some(RequestEvent::Close),
                // Nothing else can happen after close
                _ if registry.closed => None,
                _ => {
                    registry.listeners.push((kind, listener));
                    return;
                }
            }
        };
        if let Some(event) = late {
            listener(&event);
        }
    }

    /// Deliver `event` to every listener of its kind. Returns how many were called.
    ///
    /// Listeners run without the registry lock held, so they may register more.
    /// After `Close` the registry is emptied.
    pub(crate) fn emit(&self, event: &RequestEvent) -> usize {
        let mut current = {
            let mut registry = self.registry();
            match event {
                RequestEvent::Error(error) => registry.error = Some(error.clone()),
                RequestEvent::Close => registry.closed = true,
                _ => {}
            }
            std::mem::take(&mut registry.listeners)
        };

        let kind = event.kind();
        let mut delivered = 0;
        for (_, listener) in current.iter_mut().filter(|(k, _)| *k == kind) {
            listener(event);
            delivered += 1;
        }

        let mut registry = self.registry();
        if !registry.closed {
            let added = std::mem::take(&mut registry.listeners);
            current.extend(added);
            registry.listeners = current;
        }
        delivered
    }

    /// Report a failure; logged when nobody listens for errors
    pub(crate) fn emit_error(&self, error: Error) {
        let message = error.to_string();
        if self.emit(&RequestEvent::Error(Arc::new(error))) == 0 {
            tracing::warn!(error = %message, "Unhandled request error");
        }
    }
}
