//! Event handler trait and dispatch outcome.

use crate::mux::Event;

use std::io;
use std::os::fd::RawFd;

/// What the dispatch loop should do with a registration after its handler
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Re-arm the oneshot registration; keep watching.
    Continue,
    /// Tear down the registration and release the handler.
    Stop,
}

/// A polymorphic unit invoked when a readiness event fires for its ident.
///
/// Handlers are shared between the engine's table and any reference the
/// caller retains; the engine drops its reference when the handler stops.
/// A handler owning its descriptor (the usual case for protocol
/// connections) should hold an `OwnedFd` or `socket2::Socket` so the
/// descriptor closes when the last reference is dropped.
///
/// `on_event` runs outside every engine lock, on whichever worker claimed
/// the event. The oneshot protocol guarantees it is never invoked
/// concurrently with itself for the same ident. It must not block: perform
/// nonblocking I/O and return promptly.
///
/// Returning `Err` (any kind) or panicking is treated exactly like
/// [`Flow::Stop`]: the registration is removed and the engine's reference
/// released.
pub trait EventHandler: Send + Sync {
    /// The descriptor (or synthetic ident) this handler is keyed by.
    fn ident(&self) -> RawFd;

    /// Invoked with the fired event.
    ///
    /// # Errors
    ///
    /// Any error stops the watch for this ident.
    fn on_event(&self, event: &Event) -> io::Result<Flow>;
}
