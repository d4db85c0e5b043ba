//! Process-wide engine handle.
//!
//! Most proxies run exactly one engine. [`init`] constructs it once;
//! afterwards the free functions here forward to it, mirroring the
//! [`Reactor`] API for callers that do not want to thread a handle
//! through every module. The instance lives until process exit; lifecycle
//! is explicit: [`init`] before use, [`end`] then [`join`] (or
//! [`detach`]) at shutdown.
//!
//! Using any accessor before [`init`] is a programming error and panics
//! with a clear message; that panic is the documented guard for the
//! embedding application.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::reactor::{Reactor, Xfer};
use crate::signal::SignalKind;

use bytes::Bytes;
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::time::Duration;

static ENGINE: OnceLock<Reactor> = OnceLock::new();

/// Constructs the process-wide engine. Call once, before anything else.
///
/// # Errors
///
/// [`Error::AlreadyInitialized`] on a second call; otherwise whatever
/// [`Reactor::new`] reports.
pub fn init(config: Config) -> Result<()> {
    let reactor = Reactor::new(config)?;
    ENGINE
        .set(reactor)
        .map_err(|_| Error::AlreadyInitialized)
}

/// The process-wide engine.
///
/// # Panics
///
/// Panics when called before [`init`].
#[must_use]
pub fn engine() -> &'static Reactor {
    ENGINE
        .get()
        .expect("engine is not initialized; call service::init first")
}

/// The process-wide engine, if initialized.
#[must_use]
pub fn try_engine() -> Option<&'static Reactor> {
    ENGINE.get()
}

/// Starts the configured number of worker threads.
///
/// # Errors
///
/// Propagates thread-spawn failure.
pub fn start() -> Result<()> {
    let reactor = engine();
    reactor.add_thread(reactor.config().worker_threads)
}

/// Starts `count` additional worker threads.
///
/// # Errors
///
/// Propagates thread-spawn failure.
pub fn add_thread(count: usize) -> Result<()> {
    engine().add_thread(count)
}

/// Runs one dispatch iteration, for embedding in a foreign loop.
pub fn step_next() {
    engine().step_next();
}

/// Submits a deferred task.
pub fn submit<F: FnOnce() + Send + 'static>(task: F) {
    engine().submit(task);
}

/// Requests cooperative shutdown.
pub fn end() {
    engine().end();
}

/// True once [`end`] was called.
#[must_use]
pub fn is_end() -> bool {
    engine().is_end()
}

/// Waits for every worker to exit.
pub fn join() {
    engine().join();
}

/// Abandons the workers.
pub fn detach() {
    engine().detach();
}

/// Queues bytes for ordered delivery on `fd`. See [`Reactor::write`].
///
/// # Errors
///
/// See [`Reactor::write`].
pub fn write(fd: RawFd, data: impl Into<Bytes>) -> Result<()> {
    engine().write(fd, data)
}

/// Merges a transfer batch onto `fd`'s queue. See [`Reactor::commit`].
///
/// # Errors
///
/// See [`Reactor::commit`].
pub fn commit(fd: RawFd, xf: &mut Xfer) -> Result<()> {
    engine().commit(fd, xf)
}

/// Listens on `addr`. See [`Reactor::listen`].
///
/// # Errors
///
/// See [`Reactor::listen`].
pub fn listen<F>(addr: SocketAddr, backlog: i32, callback: F) -> Result<()>
where
    F: Fn(io::Result<Socket>) + Send + Sync + 'static,
{
    engine().listen(addr, backlog, callback).map(|_| ())
}

/// Event-driven connect. See [`Reactor::connect_event`].
///
/// # Errors
///
/// See [`Reactor::connect_event`].
pub fn connect_event<F>(addr: SocketAddr, timeout: Duration, callback: F) -> Result<()>
where
    F: FnOnce(io::Result<Socket>) + Send + 'static,
{
    engine().connect_event(addr, timeout, callback)
}

/// Worker-thread connect. See [`Reactor::connect_thread`].
pub fn connect_thread<F>(addr: SocketAddr, timeout: Duration, callback: F)
where
    F: FnOnce(io::Result<Socket>) + Send + 'static,
{
    engine().connect_thread(addr, timeout, callback);
}

/// Event-loop timer. See [`Reactor::timer_event`].
///
/// # Errors
///
/// See [`Reactor::timer_event`].
pub fn timer_event<F>(initial: Duration, interval: Option<Duration>, callback: F) -> Result<()>
where
    F: Fn() + Send + Sync + 'static,
{
    engine().timer_event(initial, interval, callback)
}

/// Worker-thread timer. See [`Reactor::timer_thread`].
pub fn timer_thread<F>(initial: Duration, interval: Option<Duration>, callback: F)
where
    F: Fn() + Send + Sync + 'static,
{
    engine().timer_thread(initial, interval, callback);
}

/// Signal watch through the event loop. See [`Reactor::signal_event`].
///
/// # Errors
///
/// See [`Reactor::signal_event`].
pub fn signal_event<F>(kind: SignalKind, callback: F) -> Result<()>
where
    F: Fn(SignalKind) -> bool + Send + Sync + 'static,
{
    engine().signal_event(kind, callback)
}
