//! Connect-with-timeout, in two flavors.
//!
//! [`Reactor::connect_event`] is fully event-driven: a nonblocking
//! `connect`, then write readiness races a parallel one-shot timer.
//! Whichever fires first wins a single atomic claim; the loser is a no-op,
//! so the completion callback runs exactly once. On every failure path the
//! socket is closed before the callback sees the error.
//!
//! [`Reactor::connect_thread`] runs the whole connect inside a deferred
//! task on a worker thread, polling the socket with the remaining timeout.

use crate::error::{Error, Result};
use crate::mux::{Event, Interest};
use crate::reactor::{EventHandler, Flow, Reactor};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

type ConnectCallback = Box<dyn FnOnce(io::Result<Socket>) + Send>;

/// Write-readiness side of an in-progress connect.
struct ConnectHandler {
    reactor: Reactor,
    ident: RawFd,
    sock: Mutex<Option<Socket>>,
    claimed: AtomicBool,
    callback: Mutex<Option<ConnectCallback>>,
}

impl ConnectHandler {
    /// Wins the race between readiness and timeout at most once.
    fn claim(&self) -> Option<ConnectCallback> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.callback.lock().take()
    }

    /// Timeout side: close the socket, then report exactly one timeout.
    fn timed_out(&self) {
        let Some(callback) = self.claim() else {
            return;
        };
        self.sock.lock().take();
        self.reactor.discard(self.ident);
        callback(Err(io::Error::from(io::ErrorKind::TimedOut)));
    }
}

impl EventHandler for ConnectHandler {
    fn ident(&self) -> RawFd {
        self.ident
    }

    fn on_event(&self, _event: &Event) -> io::Result<Flow> {
        let Some(callback) = self.claim() else {
            // The timeout won; nothing left but the socket to drop.
            self.sock.lock().take();
            return Ok(Flow::Stop);
        };

        match self.sock.lock().take() {
            Some(sock) => match sock.take_error() {
                Ok(None) => callback(Ok(sock)),
                Ok(Some(e)) => {
                    drop(sock);
                    callback(Err(e));
                }
                Err(e) => {
                    drop(sock);
                    callback(Err(e));
                }
            },
            None => callback(Err(io::Error::from(io::ErrorKind::NotConnected))),
        }
        Ok(Flow::Stop)
    }
}

/// Timer racing a [`ConnectHandler`].
struct ConnectTimeout {
    reactor: Reactor,
    ident: RawFd,
    target: Arc<ConnectHandler>,
}

impl EventHandler for ConnectTimeout {
    fn ident(&self) -> RawFd {
        self.ident
    }

    fn on_event(&self, event: &Event) -> io::Result<Flow> {
        let _ = self.reactor.mux().consume_timer(event);
        self.target.timed_out();
        Ok(Flow::Stop)
    }
}

impl Reactor {
    /// Event-driven connect: resolves through write readiness or the
    /// parallel `timeout` timer, invoking `callback` exactly once with the
    /// connected socket or the error (`TimedOut` on expiry).
    ///
    /// An instantly-resolved connect (success or failure before
    /// registration) delivers the callback through the deferred-task
    /// queue, never inline on the caller's stack.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created or the readiness registration
    /// fails; in that case the callback is not invoked.
    pub fn connect_event<F>(&self, addr: SocketAddr, timeout: Duration, callback: F) -> Result<()>
    where
        F: FnOnce(io::Result<Socket>) + Send + 'static,
    {
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)
            .map_err(|e| Error::setup("create socket", e))?;
        sock.set_nonblocking(true)
            .map_err(|e| Error::setup("set nonblocking flag", e))?;

        match sock.connect(&addr.into()) {
            Ok(()) => {
                self.submit(move || callback(Ok(sock)));
                return Ok(());
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => {
                drop(sock);
                self.submit(move || callback(Err(e)));
                return Ok(());
            }
        }

        let ident = sock.as_raw_fd();
        let handler = Arc::new(ConnectHandler {
            reactor: self.clone(),
            ident,
            sock: Mutex::new(Some(sock)),
            claimed: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        self.register_handler(handler.clone(), Interest::WRITABLE)?;

        // Arm the racing timer. A connect that lost its timer is still a
        // connect; the OS-level timeout remains the backstop.
        match self.mux().create_timer(timeout, None) {
            Ok(timer_ident) => {
                let timer = Arc::new(ConnectTimeout {
                    reactor: self.clone(),
                    ident: timer_ident,
                    target: handler,
                });
                match self.install(timer) {
                    Ok(()) => {
                        if let Err(e) = self.mux().arm_timer(timer_ident) {
                            self.discard(timer_ident);
                            tracing::warn!(error = %e, "connect timeout timer failed to arm");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "connect timeout timer not installed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect timeout timer unavailable");
            }
        }
        Ok(())
    }

    /// Blocking-style connect inside a deferred task: runs `connect` to
    /// completion or `timeout` on a worker thread, then invokes `callback`
    /// once with the result.
    pub fn connect_thread<F>(&self, addr: SocketAddr, timeout: Duration, callback: F)
    where
        F: FnOnce(io::Result<Socket>) + Send + 'static,
    {
        self.submit(move || callback(blocking_connect(addr, timeout)));
    }
}

fn blocking_connect(addr: SocketAddr, timeout: Duration) -> io::Result<Socket> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    sock.set_nonblocking(true)?;

    match sock.connect(&addr.into()) {
        Ok(()) => return Ok(sock),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let poll_timeout = PollTimeout::try_from(
            i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX),
        )
        .unwrap_or(PollTimeout::MAX);

        let mut fds = [PollFd::new(sock.as_fd(), PollFlags::POLLOUT)];
        match nix::poll::poll(&mut fds, poll_timeout) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::TimedOut)),
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }

    match sock.take_error()? {
        None => Ok(sock),
        Some(e) => Err(e),
    }
}
