//! Output subsystem: backpressure-aware asynchronous writes.
//!
//! Each descriptor slot owns an exclusive transfer queue behind its own
//! lock, so producers on different descriptors never contend with each
//! other or with the dispatch path. Submission drains inline when the queue
//! is empty (the fast path); whatever the descriptor refuses is queued and
//! the descriptor is armed for write readiness on the subsystem's own
//! multiplexer. That multiplexer's ident is registered into the engine's
//! main wait set, so completions arrive through the ordinary event stream
//! and are drained by whichever workers are not polling.

use crate::error::{Error, Result};
use crate::fd;
use crate::mux::{Backlog, Event, Interest, Multiplexer};
use crate::reactor::xfer::{Drain, Xfer};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Per-descriptor output state. Alive for the lifetime of the slot; the
/// queue is reset (firing pending finalizers) when the descriptor errors
/// or closes.
#[derive(Debug, Default)]
struct OutContext {
    xfer: Mutex<Xfer>,
}

/// The engine-wide output subsystem.
pub(crate) struct Out {
    mux: Arc<dyn Multiplexer>,
    contexts: Box<[OutContext]>,
    scratch: Mutex<Backlog>,
}

impl Out {
    pub(crate) fn new(
        mux: Arc<dyn Multiplexer>,
        capacity: usize,
        backlog_capacity: usize,
    ) -> Self {
        let contexts = (0..capacity).map(|_| OutContext::default()).collect();
        Self {
            mux,
            contexts,
            scratch: Mutex::new(Backlog::with_capacity(backlog_capacity)),
        }
    }

    /// The subsystem's own waitable ident, nested into the engine's
    /// multiplexer.
    pub(crate) fn ident(&self) -> RawFd {
        self.mux.ident()
    }

    fn context(&self, fd: RawFd) -> Result<&OutContext> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.contexts.get(i))
            .ok_or(Error::DescriptorLimit {
                ident: fd,
                capacity: self.contexts.len(),
            })
    }

    /// Merges a caller-built batch onto the descriptor's queue.
    ///
    /// Fast path: with an empty queue the batch is written inline; only the
    /// refused remainder is queued and write readiness armed. Slow path:
    /// a non-empty queue means bytes are already in flight, so the batch is
    /// appended without a syscall to preserve ordering.
    pub(crate) fn commit(&self, fd: RawFd, xf: &mut Xfer) -> Result<()> {
        let ctx = self.context(fd)?;
        let mut queue = ctx.xfer.lock();

        if !queue.is_empty() {
            xf.migrate(&mut queue);
            return Ok(());
        }

        match xf.drain(fd::borrowed(fd)) {
            Ok(Drain::Complete) => Ok(()),
            Ok(Drain::Blocked) => {
                xf.migrate(&mut queue);
                self.mux
                    .register(fd, Interest::WRITABLE)
                    .map_err(Error::Mux)
            }
            Err(e) => {
                tracing::debug!(fd, error = %e, "inline write failed; half-closing");
                fd::shutdown_read(fd);
                xf.reset();
                Ok(())
            }
        }
    }

    /// Collects fired write-readiness events from the subsystem's own
    /// multiplexer without blocking.
    pub(crate) fn pull_events(&self, into: &mut VecDeque<Event>) -> io::Result<()> {
        let mut backlog = self.scratch.lock();
        match self.mux.wait(&mut backlog, Some(Duration::ZERO)) {
            Ok(0) => Ok(()),
            Ok(n) => {
                for i in 0..n {
                    if let Some(ev) = backlog.get(i) {
                        into.push_back(ev);
                    }
                }
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Resumes a queue whose descriptor became writable.
    pub(crate) fn write_event(&self, event: &Event) {
        let fd = event.ident();
        let Ok(ctx) = self.context(fd) else {
            let _ = self.mux.remove(event);
            return;
        };
        let mut queue = ctx.xfer.lock();

        match queue.drain(fd::borrowed(fd)) {
            Ok(Drain::Blocked) => {
                if let Err(e) = self.mux.reactivate(event) {
                    tracing::warn!(fd, error = %e, "re-arming write readiness failed");
                    fd::shutdown_read(fd);
                    queue.reset();
                }
            }
            Ok(Drain::Complete) => {
                let _ = self.mux.remove(event);
            }
            Err(e) => {
                tracing::debug!(fd, error = %e, "queued write failed; half-closing");
                let _ = self.mux.remove(event);
                fd::shutdown_read(fd);
                queue.reset();
            }
        }
    }
}
