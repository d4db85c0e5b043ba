//! Readiness multiplexing over divergent OS notification facilities.
//!
//! A [`Multiplexer`] wraps one OS readiness queue (epoll on Linux, kqueue on
//! the BSDs) behind a single oneshot protocol:
//!
//! 1. [`register`](Multiplexer::register) arms oneshot readiness for a
//!    descriptor;
//! 2. [`wait`](Multiplexer::wait) fills a [`Backlog`] with fired [`Event`]s;
//! 3. each fired event must be turned back into a
//!    [`reactivate`](Multiplexer::reactivate) or a
//!    [`remove`](Multiplexer::remove) before it is considered live again.
//!
//! Timers and signals are synthesized as waitable idents
//! ([`create_timer`](Multiplexer::create_timer) /
//! [`create_signal`](Multiplexer::create_signal)) so they flow through the
//! same event stream as sockets. Multiplexers compose: a multiplexer's own
//! [`ident`](Multiplexer::ident) can be registered into another one, which
//! the engine uses to merge the output subsystem's readiness source into the
//! main wait set.

pub(crate) mod interest;
// Only the kqueue backend allocates synthetic idents, but the table logic
// is platform-neutral and its tests run everywhere.
#[cfg(any(
    test,
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod slot;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod kqueue;

pub use interest::Interest;

#[cfg(target_os = "linux")]
pub use epoll::Epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub use kqueue::Kqueue;

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// A fired readiness event.
///
/// Events are opaque outside this module: they carry the ident, the
/// readiness that fired, and backend-private reactivation data. An event is
/// only valid for the dispatch cycle that produced it; convert it back into
/// a reactivation or removal before the next wait.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub(crate) ident: RawFd,
    pub(crate) readiness: Interest,
    pub(crate) payload: u64,
}

impl Event {
    /// The descriptor (or synthetic ident) this event fired for.
    #[must_use]
    pub fn ident(&self) -> RawFd {
        self.ident
    }

    /// The readiness that fired.
    #[must_use]
    pub fn readiness(&self) -> Interest {
        self.readiness
    }
}

/// Batch of events filled by one [`Multiplexer::wait`] call.
///
/// Contents are invalidated (may be overwritten) by the next wait.
#[derive(Debug)]
pub struct Backlog {
    events: Vec<Event>,
    capacity: usize,
}

impl Backlog {
    /// Creates a backlog accepting up to `capacity` events per wait.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of events one wait can deliver.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events delivered by the last wait.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if the last wait delivered no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the `n`-th event of the current batch.
    #[must_use]
    pub fn get(&self, n: usize) -> Option<Event> {
        self.events.get(n).copied()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        debug_assert!(self.events.len() < self.capacity);
        self.events.push(event);
    }
}

/// One OS readiness-notification facility behind the oneshot protocol.
///
/// Implementations are `Send + Sync`; registration and waiting may happen
/// from different threads. All registrations are oneshot: a fired event
/// leaves the source inert until [`reactivate`](Self::reactivate)d, which is
/// how the engine guarantees a handler is never invoked concurrently with
/// itself.
pub trait Multiplexer: Send + Sync {
    /// Arms oneshot readiness for `fd`.
    ///
    /// # Errors
    ///
    /// Propagates the OS registration failure.
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Re-arms the registration a fired event came from.
    ///
    /// # Errors
    ///
    /// Propagates the OS re-arm failure.
    fn reactivate(&self, event: &Event) -> io::Result<()>;

    /// Tears down the registration a fired event came from and frees any
    /// ephemeral resource behind it (timer/signal ident).
    ///
    /// # Errors
    ///
    /// Propagates the OS removal failure. Removal of an already-closed
    /// descriptor is reported but harmless to ignore.
    fn remove(&self, event: &Event) -> io::Result<()>;

    /// Blocks up to `timeout` (`None` blocks indefinitely) and fills
    /// `backlog` with up to its capacity of fired events.
    ///
    /// Returns the number of events; `Ok(0)` on timeout.
    ///
    /// # Errors
    ///
    /// `ErrorKind::Interrupted` means the wait was interrupted and the
    /// caller must retry; anything else is a hard failure to propagate.
    fn wait(&self, backlog: &mut Backlog, timeout: Option<Duration>) -> io::Result<usize>;

    /// The waitable ident of this multiplexer itself, for nesting into a
    /// parent multiplexer.
    fn ident(&self) -> RawFd;

    /// Upper bound on idents this multiplexer can produce, including
    /// synthetic ones. Sizes the engine's handler table.
    fn capacity(&self) -> usize;

    /// Creates an unarmed timer ident. `interval` makes it periodic.
    ///
    /// # Errors
    ///
    /// Propagates timer-source creation failure.
    fn create_timer(&self, initial: Duration, interval: Option<Duration>) -> io::Result<RawFd>;

    /// Arms a timer ident created by [`create_timer`](Self::create_timer)
    /// for read readiness.
    ///
    /// # Errors
    ///
    /// Propagates the OS arm failure.
    fn arm_timer(&self, ident: RawFd) -> io::Result<()>;

    /// Acknowledges a fired timer event, returning the expiration count.
    ///
    /// # Errors
    ///
    /// Propagates the acknowledge failure (for descriptor-backed timers).
    fn consume_timer(&self, event: &Event) -> io::Result<u64>;

    /// Creates an unarmed signal ident for `signo`.
    ///
    /// # Errors
    ///
    /// Propagates signal-source creation failure.
    fn create_signal(&self, signo: i32) -> io::Result<RawFd>;

    /// Arms a signal ident created by [`create_signal`](Self::create_signal).
    ///
    /// # Errors
    ///
    /// Propagates the OS arm failure.
    fn arm_signal(&self, ident: RawFd) -> io::Result<()>;

    /// Acknowledges a fired signal event, returning the signal number.
    ///
    /// # Errors
    ///
    /// Propagates the acknowledge failure (for descriptor-backed signals).
    fn consume_signal(&self, event: &Event) -> io::Result<i32>;
}

/// Constructs the platform's default multiplexer backend.
///
/// # Errors
///
/// Propagates the OS facility's initialization failure.
pub fn default_multiplexer() -> io::Result<Arc<dyn Multiplexer>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(Epoll::new()?))
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    {
        Ok(Arc::new(Kqueue::new()?))
    }
}

/// Largest handler table the engine will size from the descriptor limit;
/// guards against an unlimited `RLIMIT_NOFILE`.
const DESCRIPTOR_TABLE_CAP: usize = 1 << 20;

/// Reads the soft `RLIMIT_NOFILE` bound, the descriptor-table sizing basis.
pub(crate) fn descriptor_limit() -> io::Result<usize> {
    let (soft, _hard) = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
        .map_err(io::Error::from)?;
    Ok(usize::try_from(soft)
        .unwrap_or(DESCRIPTOR_TABLE_CAP)
        .min(DESCRIPTOR_TABLE_CAP))
}
