//! The reactor engine: handler table, worker pool, shared dispatch loop.
//!
//! N worker threads cooperatively run one loop. At any instant at most one
//! of them is in the *polling* phase; the rest drain output-completion
//! events or deferred tasks, or sleep on the shared condition variable.
//! Every readiness registration is oneshot, so a handler is never invoked
//! concurrently with itself: after its event is claimed the descriptor is
//! inert until the dispatch loop reactivates it.
//!
//! The loop itself never propagates a handler's error. A handler that
//! returns an error or panics simply stops watching its descriptor; only
//! infrastructure failures (a hard multiplexer wait error) take a worker
//! down, and they are logged when they do.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fd;
use crate::mux::{self, Backlog, Event, Interest, Multiplexer};
use crate::reactor::handler::{EventHandler, Flow};
use crate::reactor::out::Out;
use crate::reactor::xfer::Xfer;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A deferred unit of work run by any available worker outside the poll
/// cycle.
type Task = Box<dyn FnOnce() + Send>;

/// Shared dispatch state, guarded by the engine's one lock.
struct DispatchState {
    /// Event batch of the current cycle. Taken by the sole polling worker
    /// so it can be filled outside the lock, then published back.
    backlog: Option<Backlog>,
    /// Next unclaimed event in the published batch.
    off: usize,
    /// Number of events in the published batch.
    num: usize,
    /// False while one worker is inside the polling phase.
    pollable: bool,
    /// Deferred tasks, FIFO.
    tasks: VecDeque<Task>,
    /// Output-completion events pulled from the out subsystem, awaiting a
    /// worker.
    out_events: VecDeque<Event>,
    /// Set when a would-be poller drained a task past the threshold;
    /// cleared by the next poll. Guarantees polling happens at least once
    /// between above-threshold drains, so a task flood cannot starve I/O.
    task_drained_since_poll: bool,
}

pub(crate) struct Inner {
    mux: Arc<dyn Multiplexer>,
    out: Out,
    /// Descriptor-indexed handler table, sized once at construction. Only
    /// slot assignment locks; dispatch clones the slot's `Arc` briefly.
    handlers: Box<[Mutex<Option<Arc<dyn EventHandler>>>]>,
    dispatch: Mutex<DispatchState>,
    cond: Condvar,
    end_flag: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: Config,
}

/// Outcome of one dispatch iteration.
#[derive(PartialEq, Eq)]
enum Iter {
    Ran,
    Ended,
}

/// The multithreaded event-driven I/O engine.
///
/// `Reactor` is a cheap handle (`Clone`) over shared engine state. Workers
/// are added with [`add_thread`](Self::add_thread); alternatively
/// [`step_next`](Self::step_next) pumps single iterations from a foreign
/// loop. Shutdown is cooperative: [`end`](Self::end) stops new cycles and
/// wakes sleepers, then [`join`](Self::join) or [`detach`](Self::detach)
/// settles the threads.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    /// Builds an engine: one multiplexer for the main wait set, one for the
    /// output subsystem (nested into the first), and a handler table sized
    /// from the descriptor limit.
    ///
    /// # Errors
    ///
    /// Fails if a multiplexer cannot be initialized or the nested
    /// registration fails.
    pub fn new(config: Config) -> Result<Self> {
        let mux = mux::default_multiplexer().map_err(Error::Mux)?;
        let out_mux = mux::default_multiplexer().map_err(Error::Mux)?;
        let capacity = config.max_descriptors.unwrap_or_else(|| mux.capacity());

        let out = Out::new(out_mux, capacity, config.backlog_capacity);
        mux.register(out.ident(), Interest::READABLE)
            .map_err(Error::Mux)?;

        let handlers = (0..capacity).map(|_| Mutex::new(None)).collect();
        let dispatch = DispatchState {
            backlog: Some(Backlog::with_capacity(config.backlog_capacity)),
            off: 0,
            num: 0,
            pollable: true,
            tasks: VecDeque::new(),
            out_events: VecDeque::new(),
            task_drained_since_poll: false,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                mux,
                out,
                handlers,
                dispatch: Mutex::new(dispatch),
                cond: Condvar::new(),
                end_flag: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Registers a handler and arms read readiness for its ident.
    ///
    /// The descriptor is made nonblocking and installed in the handler
    /// table; the returned reference may be retained by the caller without
    /// affecting the engine's ownership of the handler.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor exceeds the table capacity or the OS
    /// rejects the registration.
    pub fn add_handler<H: EventHandler + 'static>(&self, handler: H) -> Result<Arc<H>> {
        let sh = Arc::new(handler);
        self.register_handler(sh.clone(), Interest::READABLE)?;
        Ok(sh)
    }

    /// Installs `sh` and arms the given oneshot interest.
    pub(crate) fn register_handler(
        &self,
        sh: Arc<dyn EventHandler>,
        interest: Interest,
    ) -> Result<()> {
        let ident = sh.ident();
        fd::set_nonblocking(ident).map_err(|e| Error::setup("set nonblocking flag", e))?;
        self.install(sh)?;
        if let Err(e) = self.inner.mux.register(ident, interest) {
            self.discard(ident);
            return Err(Error::Mux(e));
        }
        Ok(())
    }

    /// Assigns a handler-table slot without touching the multiplexer. Used
    /// by fronts that arm their source separately (timers, signals).
    pub(crate) fn install(&self, sh: Arc<dyn EventHandler>) -> Result<()> {
        let ident = sh.ident();
        let slot = usize::try_from(ident)
            .ok()
            .and_then(|i| self.inner.handlers.get(i))
            .ok_or(Error::DescriptorLimit {
                ident,
                capacity: self.inner.handlers.len(),
            })?;
        *slot.lock() = Some(sh);
        Ok(())
    }

    /// Clears a handler-table slot, releasing the engine's reference.
    pub(crate) fn discard(&self, ident: RawFd) {
        if let Some(slot) = usize::try_from(ident)
            .ok()
            .and_then(|i| self.inner.handlers.get(i))
        {
            slot.lock().take();
        }
    }

    pub(crate) fn mux(&self) -> &Arc<dyn Multiplexer> {
        &self.inner.mux
    }

    /// Submits a task for asynchronous execution on any worker, FIFO per
    /// submitting thread.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) {
        let mut d = self.inner.dispatch.lock();
        d.tasks.push_back(Box::new(task));
        self.inner.cond.notify_one();
    }

    /// Starts `count` additional worker threads.
    ///
    /// # Errors
    ///
    /// Propagates thread-spawn failure.
    pub fn add_thread(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.spawn_worker(None)?;
        }
        Ok(())
    }

    /// Starts `count` worker threads, running `init` on each before it
    /// enters the loop. Returns once every `init` has completed.
    ///
    /// # Errors
    ///
    /// Propagates thread-spawn failure.
    pub fn add_thread_init<F>(&self, count: usize, init: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let init: Arc<dyn Fn() + Send + Sync> = Arc::new(init);
        let started = Arc::new((Mutex::new(0usize), Condvar::new()));
        for _ in 0..count {
            self.spawn_worker(Some((Arc::clone(&init), Arc::clone(&started))))?;
        }
        let (lock, cond) = &*started;
        let mut done = lock.lock();
        while *done < count {
            cond.wait(&mut done);
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn spawn_worker(
        &self,
        init: Option<(Arc<dyn Fn() + Send + Sync>, Arc<(Mutex<usize>, Condvar)>)>,
    ) -> Result<()> {
        static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);
        let id = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);

        let handle = thread::Builder::new()
            .name(format!("swell-worker-{id}"))
            .spawn(move || {
                if let Some((init, started)) = init {
                    let ok = catch_unwind(AssertUnwindSafe(|| init())).is_ok();
                    let (lock, cond) = &*started;
                    *lock.lock() += 1;
                    cond.notify_all();
                    if !ok {
                        tracing::error!(worker = id, "per-thread init panicked; not starting");
                        return;
                    }
                }
                tracing::trace!(worker = id, "worker started");
                while inner.iteration(false) == Iter::Ran {}
                tracing::trace!(worker = id, "worker exiting");
            })
            .map_err(|e| Error::setup("spawn worker thread", e))?;

        self.inner.workers.lock().push(handle);
        Ok(())
    }

    /// Runs a single dispatch iteration: claim one event, or one deferred
    /// task, or one poll. For embedding the engine in a foreign loop.
    pub fn step_next(&self) {
        if !self.is_end() {
            self.inner.iteration(true);
        }
    }

    /// Sets the end flag and wakes every sleeping worker. In-flight handler
    /// invocations run to completion; a blocked poll observes the flag
    /// within its bounded timeout.
    pub fn end(&self) {
        self.inner.end_flag.store(true, Ordering::Release);
        let _d = self.inner.dispatch.lock();
        self.inner.cond.notify_all();
    }

    /// True once [`end`](Self::end) has been called.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.inner.end_flag.load(Ordering::Acquire)
    }

    /// Waits for every worker thread to exit.
    pub fn join(&self) {
        let handles: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    /// Abandons the worker threads.
    pub fn detach(&self) {
        self.inner.workers.lock().clear();
    }

    // ── Output façade ──────────────────────────────────────────────────

    /// Queues `data` for delivery on `fd`, in submission order, without
    /// blocking.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor exceeds the table capacity or write
    /// readiness cannot be armed.
    pub fn write(&self, fd: RawFd, data: impl Into<Bytes>) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_write(data);
        self.commit(fd, &mut xf)
    }

    /// [`write`](Self::write) with a completion finalizer that fires
    /// exactly once when the bytes were delivered or abandoned.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn write_with(
        &self,
        fd: RawFd,
        data: impl Into<Bytes>,
        fin: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_write(data);
        xf.push_finalize(fin);
        self.commit(fd, &mut xf)
    }

    /// Queues a scatter list as one vectored write.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn writev(&self, fd: RawFd, bufs: impl IntoIterator<Item = Bytes>) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_writev(bufs);
        self.commit(fd, &mut xf)
    }

    /// [`writev`](Self::writev) with a completion finalizer.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn writev_with(
        &self,
        fd: RawFd,
        bufs: impl IntoIterator<Item = Bytes>,
        fin: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_writev(bufs);
        xf.push_finalize(fin);
        self.commit(fd, &mut xf)
    }

    /// Queues a file region for zero-copy transmission.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn send_file(&self, fd: RawFd, file: Arc<File>, offset: u64, len: usize) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_send_file(file, offset, len);
        self.commit(fd, &mut xf)
    }

    /// [`send_file`](Self::send_file) with a completion finalizer.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn send_file_with(
        &self,
        fd: RawFd,
        file: Arc<File>,
        offset: u64,
        len: usize,
        fin: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_send_file(file, offset, len);
        xf.push_finalize(fin);
        self.commit(fd, &mut xf)
    }

    /// Queues a memory header followed by a file region.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn hsend_file(
        &self,
        fd: RawFd,
        header: impl Into<Bytes>,
        file: Arc<File>,
        offset: u64,
        len: usize,
    ) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_write(header);
        xf.push_send_file(file, offset, len);
        self.commit(fd, &mut xf)
    }

    /// [`hsend_file`](Self::hsend_file) with a completion finalizer.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn hsend_file_with(
        &self,
        fd: RawFd,
        header: impl Into<Bytes>,
        file: Arc<File>,
        offset: u64,
        len: usize,
        fin: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_write(header);
        xf.push_send_file(file, offset, len);
        xf.push_finalize(fin);
        self.commit(fd, &mut xf)
    }

    /// Queues a vector header followed by a file region.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn hvsend_file(
        &self,
        fd: RawFd,
        header: impl IntoIterator<Item = Bytes>,
        file: Arc<File>,
        offset: u64,
        len: usize,
    ) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_writev(header);
        xf.push_send_file(file, offset, len);
        self.commit(fd, &mut xf)
    }

    /// [`hvsend_file`](Self::hvsend_file) with a completion finalizer.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub fn hvsend_file_with(
        &self,
        fd: RawFd,
        header: impl IntoIterator<Item = Bytes>,
        file: Arc<File>,
        offset: u64,
        len: usize,
        fin: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut xf = Xfer::new();
        xf.push_writev(header);
        xf.push_send_file(file, offset, len);
        xf.push_finalize(fin);
        self.commit(fd, &mut xf)
    }

    /// Merges a caller-built [`Xfer`] batch onto `fd`'s transfer queue
    /// atomically, writing inline when the queue is idle.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor exceeds the table capacity or write
    /// readiness cannot be armed.
    pub fn commit(&self, fd: RawFd, xf: &mut Xfer) -> Result<()> {
        self.inner.out.commit(fd, xf)
    }
}

impl Inner {
    /// One dispatch iteration. `once` is the `step_next` flavor: condition
    /// waits and empty polls return instead of retrying.
    fn iteration(&self, once: bool) -> Iter {
        let mut d = self.dispatch.lock();
        loop {
            if self.end_flag.load(Ordering::Acquire) {
                return Iter::Ended;
            }

            if !d.pollable {
                // Another worker holds the polling phase; be useful or sleep.
                if let Some(ev) = d.out_events.pop_front() {
                    drop(d);
                    self.out.write_event(&ev);
                    return Iter::Ran;
                }
                if let Some(task) = d.tasks.pop_front() {
                    if !d.tasks.is_empty() {
                        self.cond.notify_one();
                    }
                    drop(d);
                    run_task(task);
                    return Iter::Ran;
                }
                self.cond.wait(&mut d);
                if once {
                    return Iter::Ran;
                }
                continue;
            }

            // A single-step pump drains any pending task before polling; a
            // pooled worker only does so past the threshold, and never twice
            // in a row without a poll in between.
            let drain_task = if once {
                !d.tasks.is_empty()
            } else {
                d.tasks.len() > self.config.task_queue_limit && !d.task_drained_since_poll
            };
            if drain_task {
                if !once {
                    d.task_drained_since_poll = true;
                }
                let task = d.tasks.pop_front().expect("task queue is non-empty");
                if !d.tasks.is_empty() {
                    self.cond.notify_one();
                }
                drop(d);
                run_task(task);
                return Iter::Ran;
            }

            if d.num == d.off {
                // Completions must not wait out a full poll timeout when
                // this is the only awake worker.
                if let Some(ev) = d.out_events.pop_front() {
                    drop(d);
                    self.out.write_event(&ev);
                    return Iter::Ran;
                }

                d.pollable = false;
                let mut backlog = d.backlog.take().expect("backlog present while pollable");
                // With a flooded task queue the poll is only an I/O check,
                // not a wait; the backlog of tasks still has to drain.
                let poll_timeout = if d.tasks.len() > self.config.task_queue_limit {
                    Duration::ZERO
                } else {
                    self.config.poll_timeout
                };
                drop(d);

                let num = loop {
                    match self.mux.wait(&mut backlog, Some(poll_timeout)) {
                        // A timed-out wait publishes an empty batch so the
                        // outer loop re-examines the end flag and queues.
                        Ok(n) => break n,
                        Err(e)
                            if e.kind() == io::ErrorKind::Interrupted
                                || e.kind() == io::ErrorKind::WouldBlock =>
                        {
                            if once || self.end_flag.load(Ordering::Acquire) {
                                break 0;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "multiplexer wait failed; worker exiting");
                            let mut d = self.dispatch.lock();
                            d.backlog = Some(backlog);
                            d.pollable = true;
                            self.cond.notify_one();
                            return Iter::Ended;
                        }
                    }
                };

                d = self.dispatch.lock();
                d.backlog = Some(backlog);
                d.off = 0;
                d.num = num;
                d.pollable = true;
                d.task_drained_since_poll = false;
                self.cond.notify_one();

                if num == 0 {
                    return if self.end_flag.load(Ordering::Acquire) {
                        Iter::Ended
                    } else {
                        Iter::Ran
                    };
                }
            }

            let ev = d
                .backlog
                .as_ref()
                .and_then(|b| b.get(d.off))
                .expect("claimed event within published batch");
            d.off += 1;
            drop(d);

            self.dispatch_event(ev);
            return Iter::Ran;
        }
    }

    /// Invokes the handler for one claimed event, outside every lock.
    fn dispatch_event(&self, ev: Event) {
        if ev.ident() == self.out.ident() {
            // Output subsystem readiness: collect its completion events for
            // the worker pool, then re-arm the nested registration.
            let mut pulled = VecDeque::new();
            match self.out.pull_events(&mut pulled) {
                Ok(()) => {
                    if !pulled.is_empty() {
                        let mut d = self.dispatch.lock();
                        d.out_events.append(&mut pulled);
                        self.cond.notify_one();
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "output multiplexer wait failed");
                }
            }
            if let Err(e) = self.mux.reactivate(&ev) {
                tracing::error!(error = %e, "re-arming output subsystem failed");
            }
            return;
        }

        let handler = usize::try_from(ev.ident())
            .ok()
            .and_then(|i| self.handlers.get(i))
            .and_then(|slot| slot.lock().clone());

        let flow = match handler {
            Some(h) => match catch_unwind(AssertUnwindSafe(|| h.on_event(&ev))) {
                Ok(Ok(flow)) => flow,
                Ok(Err(e)) => {
                    tracing::debug!(ident = ev.ident(), error = %e, "handler error; stopping");
                    Flow::Stop
                }
                Err(_) => {
                    tracing::warn!(ident = ev.ident(), "handler panicked; stopping");
                    Flow::Stop
                }
            },
            None => Flow::Stop,
        };

        match flow {
            Flow::Continue => {
                if let Err(e) = self.mux.reactivate(&ev) {
                    tracing::warn!(ident = ev.ident(), error = %e, "reactivate failed; stopping");
                    let _ = self.mux.remove(&ev);
                    self.clear_slot(ev.ident());
                }
            }
            Flow::Stop => {
                let _ = self.mux.remove(&ev);
                self.clear_slot(ev.ident());
            }
        }
    }

    fn clear_slot(&self, ident: RawFd) {
        if let Some(slot) = usize::try_from(ident)
            .ok()
            .and_then(|i| self.handlers.get(i))
        {
            slot.lock().take();
        }
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::warn!("deferred task panicked");
    }
}
