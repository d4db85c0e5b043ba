//! Signal delivery as ordinary events.
//!
//! [`Reactor::signal_event`] blocks the signal for the calling thread and
//! converts its delivery into a readiness event; the callback's return
//! value decides whether to keep watching (`true`) or stop and restore the
//! default disposition (`false`).
//!
//! Thread masks are inherited at spawn, so install signal watches **before**
//! [`Reactor::add_thread`]: workers created afterwards inherit the blocked
//! mask, and the signal reaches the engine instead of a default handler on
//! some unrelated thread.

use crate::error::{Error, Result};
use crate::mux::Event;
use crate::reactor::{EventHandler, Flow, Reactor};

use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Unix signals the engine can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SignalKind {
    /// SIGINT - interrupt from keyboard (Ctrl+C).
    Interrupt,
    /// SIGTERM - termination request.
    Terminate,
    /// SIGHUP - hangup on the controlling terminal.
    Hangup,
    /// SIGQUIT - quit from keyboard.
    Quit,
    /// SIGUSR1 - user-defined signal 1.
    User1,
    /// SIGUSR2 - user-defined signal 2.
    User2,
    /// SIGCHLD - child stopped or terminated.
    Child,
    /// SIGPIPE - broken pipe.
    Pipe,
    /// SIGALRM - timer signal.
    Alarm,
}

impl SignalKind {
    /// The raw signal number.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Hangup => libc::SIGHUP,
            Self::Quit => libc::SIGQUIT,
            Self::User1 => libc::SIGUSR1,
            Self::User2 => libc::SIGUSR2,
            Self::Child => libc::SIGCHLD,
            Self::Pipe => libc::SIGPIPE,
            Self::Alarm => libc::SIGALRM,
        }
    }

    /// Maps a raw signal number back, when it is one the engine names.
    #[must_use]
    pub const fn from_raw(signo: i32) -> Option<Self> {
        match signo {
            libc::SIGINT => Some(Self::Interrupt),
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGHUP => Some(Self::Hangup),
            libc::SIGQUIT => Some(Self::Quit),
            libc::SIGUSR1 => Some(Self::User1),
            libc::SIGUSR2 => Some(Self::User2),
            libc::SIGCHLD => Some(Self::Child),
            libc::SIGPIPE => Some(Self::Pipe),
            libc::SIGALRM => Some(Self::Alarm),
            _ => None,
        }
    }

    fn sigset(self) -> io::Result<(SigSet, Signal)> {
        let signal = Signal::try_from(self.as_raw()).map_err(io::Error::from)?;
        let mut set = SigSet::empty();
        set.add(signal);
        Ok((set, signal))
    }
}

struct SignalHandler {
    reactor: Reactor,
    ident: RawFd,
    kind: SignalKind,
    set: SigSet,
    callback: Box<dyn Fn(SignalKind) -> bool + Send + Sync>,
}

impl EventHandler for SignalHandler {
    fn ident(&self) -> RawFd {
        self.ident
    }

    fn on_event(&self, event: &Event) -> io::Result<Flow> {
        let _ = self.reactor.mux().consume_signal(event);
        Ok(if (self.callback)(self.kind) {
            Flow::Continue
        } else {
            Flow::Stop
        })
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        // Restore the default disposition for this thread.
        let _ = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&self.set), None);
    }
}

impl Reactor {
    /// Watches `kind`: the signal is blocked for the calling thread and
    /// delivered through the event loop. `callback` returning `false`
    /// stops the watch and restores the default disposition.
    ///
    /// # Errors
    ///
    /// Fails if the signal cannot be blocked or its event source cannot be
    /// created or armed.
    pub fn signal_event<F>(&self, kind: SignalKind, callback: F) -> Result<()>
    where
        F: Fn(SignalKind) -> bool + Send + Sync + 'static,
    {
        let (set, _signal) = kind
            .sigset()
            .map_err(|e| Error::setup("resolve signal", e))?;
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
            .map_err(|e| Error::setup("block signal", io::Error::from(e)))?;

        let ident = self
            .mux()
            .create_signal(kind.as_raw())
            .map_err(Error::Mux)?;
        let handler = Arc::new(SignalHandler {
            reactor: self.clone(),
            ident,
            kind,
            set,
            callback: Box::new(callback),
        });
        self.install(handler)?;
        if let Err(e) = self.mux().arm_signal(ident) {
            self.discard(ident);
            return Err(Error::Mux(e));
        }
        Ok(())
    }

    /// Blocking flavor: a deferred task that waits on the signal set and
    /// invokes `callback` per delivery until it returns `false` or the
    /// engine ends. Occupies one worker thread for its whole lifetime.
    ///
    /// # Errors
    ///
    /// Fails if the signals cannot be blocked on the calling thread.
    pub fn signal_thread<F>(&self, kinds: &[SignalKind], callback: F) -> Result<()>
    where
        F: Fn(SignalKind) -> bool + Send + Sync + 'static,
    {
        let mut set = SigSet::empty();
        for kind in kinds {
            let (_, signal) = kind
                .sigset()
                .map_err(|e| Error::setup("resolve signal", e))?;
            set.add(signal);
        }
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
            .map_err(|e| Error::setup("block signals", io::Error::from(e)))?;

        let reactor = self.clone();
        self.submit(move || {
            // The worker running this task needs the mask too.
            let _ = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None);
            while !reactor.is_end() {
                match set.wait() {
                    Ok(signal) => {
                        let Some(kind) = SignalKind::from_raw(signal as i32) else {
                            continue;
                        };
                        if !callback(kind) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sigwait failed; stopping signal task");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for kind in [
            SignalKind::Interrupt,
            SignalKind::Terminate,
            SignalKind::User1,
            SignalKind::Child,
        ] {
            assert_eq!(SignalKind::from_raw(kind.as_raw()), Some(kind));
        }
        assert_eq!(SignalKind::from_raw(-1), None);
    }
}
