//! Placeholder request handle that records operations until the real one exists

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::transport::{Command, Dispatch, Emitter, EventKind, RequestEvent, RequestHandle};

/// Lifecycle of a tunneled call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connected,
    Failed,
}

enum Slot {
    /// Commands recorded in call order
    Pending(Vec<Command>),
    Connected(Box<dyn RequestHandle>),
    /// Holds the reported failure for listeners registered afterwards
    Failed(Emitter),
}

impl Slot {
    fn state(&self) -> SessionState {
        match self {
            Slot::Pending(_) => SessionState::Pending,
            Slot::Connected(_) => SessionState::Connected,
            Slot::Failed(_) => SessionState::Failed,
        }
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn forward(handle: &mut dyn RequestHandle, command: Command) {
    let name = command.name();
    if handle.dispatch(command) == Dispatch::Unsupported {
        tracing::trace!(operation = name, "Operation not supported by request, skipped");
    }
}

/// Replay the queue against `handle` and make it the delegate.
///
/// The slot lock is held throughout, so operations issued concurrently land
/// after the replayed ones.
fn resolve(slot: &Mutex<Slot>, target: &str, mut handle: Box<dyn RequestHandle>) -> Result<()> {
    let mut slot = lock(slot);
    let queue = match &mut *slot {
        Slot::Pending(queue) => std::mem::take(queue),
        other => {
            tracing::error!(
                target = %target,
                state = ?other.state(),
                "Rejected second resolution of deferred request"
            );
            return Err(Error::AlreadyResolved);
        }
    };

    tracing::debug!(target = %target, replayed = queue.len(), "Deferred request resolved");
    for command in queue {
        forward(handle.as_mut(), command);
    }
    *slot = Slot::Connected(handle);
    Ok(())
}

/// Mark the call failed and report `error` to its error and close listeners.
///
/// Listeners registered after this point are answered from the failed slot.
fn fail(slot: &Mutex<Slot>, target: &str, error: Error) -> Result<()> {
    let emitter = {
        let mut slot = lock(slot);
        let queue = match &mut *slot {
            Slot::Pending(queue) => std::mem::take(queue),
            other => {
                tracing::error!(
                    target = %target,
                    state = ?other.state(),
                    "Rejected failure of already resolved deferred request"
                );
                return Err(Error::AlreadyResolved);
            }
        };

        let emitter = Emitter::default();
        for command in queue {
            match command {
                Command::On(kind @ (EventKind::Error | EventKind::Close), listener) => {
                    emitter.add(kind, listener)
                }
                other => tracing::trace!(operation = other.name(), "Dropped with failed tunnel"),
            }
        }
        *slot = Slot::Failed(emitter.clone());
        emitter
    };

    emitter.emit_error(error);
    emitter.emit(&RequestEvent::Close);
    Ok(())
}

/// Placeholder handle returned before the tunnel exists.
///
/// While pending, every operation is queued. Once the session connects, the
/// queue is replayed in order against the real request and later operations
/// go straight through. Operations the real request does not support are
/// skipped.
pub struct DeferredRequest {
    slot: Arc<Mutex<Slot>>,
}

impl DeferredRequest {
    pub fn state(&self) -> SessionState {
        lock(&self.slot).state()
    }

    /// Number of operations waiting for the tunnel
    pub fn queued(&self) -> usize {
        match &*lock(&self.slot) {
            Slot::Pending(queue) => queue.len(),
            _ => 0,
        }
    }
}

impl RequestHandle for DeferredRequest {
    fn dispatch(&mut self, command: Command) -> Dispatch {
        let mut slot = lock(&self.slot);
        let emitter = match &mut *slot {
            Slot::Pending(queue) => {
                queue.push(command);
                return Dispatch::Handled;
            }
            Slot::Connected(handle) => {
                forward(handle.as_mut(), command);
                return Dispatch::Handled;
            }
            Slot::Failed(emitter) => emitter.clone(),
        };
        drop(slot);

        // Listeners run outside the slot lock so they may use the placeholder
        match command {
            Command::On(kind, listener) => emitter.add(kind, listener),
            other => tracing::debug!(operation = other.name(), "Dropped on failed tunnel"),
        }
        Dispatch::Handled
    }
}

/// Per-call tunnel state. Owns the placeholder's queue and, once connected,
/// the real request.
///
/// Transitions consume the session, so it resolves at most once.
pub struct TunnelSession {
    target: String,
    slot: Arc<Mutex<Slot>>,
}

impl TunnelSession {
    /// Start a pending session for `target` (`host:port`) and its placeholder
    pub fn open(target: impl Into<String>) -> (Self, DeferredRequest) {
        let slot = Arc::new(Mutex::new(Slot::Pending(Vec::new())));
        let session = Self {
            target: target.into(),
            slot: slot.clone(),
        };
        (session, DeferredRequest { slot })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        lock(&self.slot).state()
    }

    /// Tunnel is up: replay queued operations against `handle`
    pub fn connect(self, handle: Box<dyn RequestHandle>) -> Result<()> {
        resolve(&self.slot, &self.target, handle)
    }

    /// Tunnel could not be established
    pub fn fail(self, error: Error) -> Result<()> {
        fail(&self.slot, &self.target, error)
    }
}
