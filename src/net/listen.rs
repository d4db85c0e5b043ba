//! Asynchronous listen/accept.
//!
//! A listening socket is configured for address reuse, bound, put into
//! listen mode, and registered as a permanent read handler: every fire
//! accepts in a loop until the queue is dry. The accept callback receives
//! each new connection; a panicking callback only costs that one
//! connection, while a hard `accept` failure is reported to the callback
//! and then stops the listener.

use crate::error::{Error, Result};
use crate::mux::Event;
use crate::reactor::{EventHandler, Flow, Reactor};

use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

type AcceptCallback = dyn Fn(io::Result<Socket>) + Send + Sync;

/// Read handler accepting connections on one listening socket.
///
/// Owns the socket; it closes when the listener stops and the last
/// reference drops.
pub struct ListenHandler {
    sock: Socket,
    callback: Box<AcceptCallback>,
}

impl ListenHandler {
    /// The bound local address (useful with an ephemeral port).
    ///
    /// # Errors
    ///
    /// Propagates `getsockname` failure.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "listener address is not inet")
        })
    }
}

impl EventHandler for ListenHandler {
    fn ident(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn on_event(&self, _event: &Event) -> io::Result<Flow> {
        loop {
            match self.sock.accept() {
                Ok((conn, _peer)) => {
                    if catch_unwind(AssertUnwindSafe(|| (self.callback)(Ok(conn)))).is_err() {
                        // The accepted socket died with the unwind; keep
                        // accepting.
                        tracing::warn!(listener = self.ident(), "accept callback panicked");
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(Flow::Continue);
                }
                Err(e) => {
                    let fatal = io::Error::from(e.kind());
                    (self.callback)(Err(e));
                    return Err(fatal);
                }
            }
        }
    }
}

impl Reactor {
    /// Binds `addr`, listens with `backlog`, and registers a permanent
    /// accept handler invoking `callback` with every new connection.
    ///
    /// The returned handle keeps the listener's ident visible to the
    /// caller; dropping it does not stop the listener.
    ///
    /// # Errors
    ///
    /// Fails if socket creation, bind, listen, or the registration fails.
    pub fn listen<F>(&self, addr: SocketAddr, backlog: i32, callback: F) -> Result<Arc<ListenHandler>>
    where
        F: Fn(io::Result<Socket>) + Send + Sync + 'static,
    {
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)
            .map_err(|e| Error::setup("create listening socket", e))?;
        sock.set_reuse_address(true)
            .map_err(|e| Error::setup("set SO_REUSEADDR", e))?;
        sock.bind(&addr.into())
            .map_err(|e| Error::setup("bind listening socket", e))?;
        sock.listen(backlog)
            .map_err(|e| Error::setup("listen", e))?;

        self.add_handler(ListenHandler {
            sock,
            callback: Box::new(callback),
        })
    }
}
