//! Timers as ordinary events.
//!
//! [`Reactor::timer_event`] synthesizes a waitable timer ident from the
//! multiplexer; its firings flow through the same dispatch loop as socket
//! readiness. One-shot timers are removed after the first fire; periodic
//! timers (those with a repeat interval) are continuously reactivated.
//!
//! [`Reactor::timer_thread`] is the blocking flavor: a deferred task that
//! sleeps and re-submits the callback, pinning one worker for its
//! lifetime.

use crate::error::{Error, Result};
use crate::mux::Event;
use crate::reactor::{EventHandler, Flow, Reactor};

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct TimerHandler {
    reactor: Reactor,
    ident: RawFd,
    periodic: bool,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl EventHandler for TimerHandler {
    fn ident(&self) -> RawFd {
        self.ident
    }

    fn on_event(&self, event: &Event) -> io::Result<Flow> {
        // Acknowledge the expiration; a spurious wake is not worth
        // stopping the timer over.
        let _ = self.reactor.mux().consume_timer(event);
        (self.callback)();
        Ok(if self.periodic {
            Flow::Continue
        } else {
            Flow::Stop
        })
    }
}

impl Reactor {
    /// Arms a timer delivered through the event loop: first fire after
    /// `initial`, then every `interval` if one is given.
    ///
    /// # Errors
    ///
    /// Fails if the timer source cannot be created or armed.
    pub fn timer_event<F>(&self, initial: Duration, interval: Option<Duration>, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let ident = self.mux().create_timer(initial, interval).map_err(Error::Mux)?;
        let handler = Arc::new(TimerHandler {
            reactor: self.clone(),
            ident,
            periodic: interval.is_some(),
            callback: Box::new(callback),
        });
        self.install(handler)?;
        if let Err(e) = self.mux().arm_timer(ident) {
            self.discard(ident);
            return Err(Error::Mux(e));
        }
        Ok(())
    }

    /// Blocking timer inside a deferred task: sleeps `initial`, fires, then
    /// keeps firing every `interval` until the engine ends. Occupies one
    /// worker thread for its whole lifetime; prefer
    /// [`timer_event`](Self::timer_event) unless the callback needs a
    /// thread of its own.
    pub fn timer_thread<F>(&self, initial: Duration, interval: Option<Duration>, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let reactor = self.clone();
        let callback = Arc::new(callback);
        self.submit(move || {
            thread::sleep(initial);
            if reactor.is_end() {
                return;
            }
            let fire = Arc::clone(&callback);
            reactor.submit(move || fire());

            let Some(interval) = interval else {
                return;
            };
            while !reactor.is_end() {
                thread::sleep(interval);
                if reactor.is_end() {
                    break;
                }
                let fire = Arc::clone(&callback);
                reactor.submit(move || fire());
            }
        });
    }
}
