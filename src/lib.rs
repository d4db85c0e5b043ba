//! swell — multithreaded event-driven I/O reactor for protocol proxies.
//!
//! The engine unifies divergent OS readiness-notification facilities
//! (epoll, kqueue) behind one oneshot interface, multiplexes many sockets
//! across a worker-thread pool running a single shared dispatch loop, and
//! guarantees at-most-one-concurrent-invocation per registered handler.
//! Around that core it provides asynchronous connect-with-timeout,
//! listen/accept, timers and signal delivery as ordinary events, and a
//! backpressure-aware output path with partial-write queueing, vectored
//! writes, zero-copy file transmission, and exactly-once completion
//! callbacks.
//!
//! Bytes are opaque to the engine: protocol parsing, request handling and
//! backend management live in the embedding application, which consumes
//! the handler-registration, output, listen/connect/timer/signal and
//! lifecycle APIs exposed here.
//!
//! # Quick start
//!
//! ```no_run
//! use std::io::{self, Read};
//! use std::os::fd::{AsRawFd, RawFd};
//! use swell::{Config, Event, EventHandler, Flow, Reactor};
//!
//! struct Echo {
//!     engine: Reactor,
//!     sock: socket2::Socket,
//! }
//!
//! impl EventHandler for Echo {
//!     fn ident(&self) -> RawFd {
//!         self.sock.as_raw_fd()
//!     }
//!
//!     fn on_event(&self, _event: &Event) -> io::Result<Flow> {
//!         let mut buf = [0u8; 4096];
//!         loop {
//!             match (&self.sock).read(&mut buf) {
//!                 Ok(0) => return Ok(Flow::Stop),
//!                 Ok(n) => {
//!                     if self.engine.write(self.ident(), buf[..n].to_vec()).is_err() {
//!                         return Ok(Flow::Stop);
//!                     }
//!                 }
//!                 Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Continue),
//!                 Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
//!                 Err(e) => return Err(e),
//!             }
//!         }
//!     }
//! }
//!
//! fn main() -> swell::Result<()> {
//!     let reactor = Reactor::new(Config::default())?;
//!     let engine = reactor.clone();
//!     reactor.listen("127.0.0.1:7878".parse().unwrap(), 1024, move |conn| {
//!         if let Ok(sock) = conn {
//!             let _ = engine.add_handler(Echo {
//!                 engine: engine.clone(),
//!                 sock,
//!             });
//!         }
//!     })?;
//!     reactor.add_thread(4)?;
//!     reactor.join();
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod fd;
pub mod mux;
mod net;
mod reactor;
pub mod service;
mod signal;
mod time;

/// Engine configuration.
pub use config::{Config, ConfigBuilder};
/// Engine errors.
pub use error::{Error, Result};
/// Readiness interest flags.
pub use mux::Interest;
/// A fired readiness event.
pub use mux::Event;
/// Accept handler returned by [`Reactor::listen`].
pub use net::ListenHandler;
/// The engine.
pub use reactor::Reactor;
/// Handler trait invoked on readiness events.
pub use reactor::EventHandler;
/// Dispatch outcome: keep watching or stop.
pub use reactor::Flow;
/// Exactly-once completion callback for output segments.
pub use reactor::Finalizer;
/// Caller-built transfer batch for [`Reactor::commit`].
pub use reactor::Xfer;
/// Unix signals the engine can watch.
pub use signal::SignalKind;
