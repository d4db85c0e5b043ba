//! Linux epoll-based multiplexer.
//!
//! This backend uses epoll in oneshot mode (`EPOLLONESHOT`) and synthesizes
//! timers and signals as `timerfd`/`signalfd` descriptors registered for
//! read readiness.
//!
//! # Safety
//!
//! This module interfaces with epoll, timerfd and signalfd through `libc`.
//! The compiler cannot verify that descriptors stay valid for the duration
//! of their registration; [`Epoll`] maintains that invariant by owning the
//! epoll descriptor and every virtual descriptor it creates, and by closing
//! virtual descriptors only on [`remove`](super::Multiplexer::remove).
//!
//! # Event encoding
//!
//! The epoll data word packs `ident | interest_mask << 32` so a fired event
//! carries everything needed to re-arm the same registration without a
//! lookup, mirroring the registration word epoll stored.

#![allow(unsafe_code)]

use crate::mux::{Backlog, Event, Interest, Multiplexer, descriptor_limit};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Kind of virtual descriptor, so removal can release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Virtual {
    Timer,
    Signal,
}

/// Linux epoll backend with oneshot semantics.
pub struct Epoll {
    ep: RawFd,
    /// Virtual (timerfd/signalfd) descriptors owned by this multiplexer.
    virtuals: Mutex<HashMap<RawFd, Virtual>>,
    /// Raw event buffer for `epoll_wait`; one waiter at a time in practice.
    scratch: Mutex<Vec<libc::epoll_event>>,
    capacity: usize,
}

impl Epoll {
    /// Creates a new epoll instance.
    ///
    /// # Errors
    ///
    /// Returns an error if `epoll_create1` or the descriptor-limit probe
    /// fails.
    pub fn new() -> io::Result<Self> {
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep < 0 {
            return Err(io::Error::last_os_error());
        }
        let capacity = match descriptor_limit() {
            Ok(n) => n,
            Err(e) => {
                unsafe { libc::close(ep) };
                return Err(e);
            }
        };
        Ok(Self {
            ep,
            virtuals: Mutex::new(HashMap::new()),
            scratch: Mutex::new(Vec::new()),
            capacity,
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: pack(fd, mask),
        };
        let rc = unsafe { libc::epoll_ctl(self.ep, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn release_virtual(&self, fd: RawFd) {
        if self.virtuals.lock().remove(&fd).is_some() {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        for (&fd, _) in self.virtuals.lock().iter() {
            unsafe { libc::close(fd) };
        }
        unsafe { libc::close(self.ep) };
    }
}

const fn pack(fd: RawFd, mask: u32) -> u64 {
    (fd as u32 as u64) | ((mask as u64) << 32)
}

fn interest_mask(interest: Interest) -> u32 {
    let mut mask = libc::EPOLLONESHOT as u32;
    if interest.is_readable() {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

fn fired_readiness(events: u32) -> Interest {
    let mut readiness = Interest::NONE;
    let err = events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
    if events & libc::EPOLLIN as u32 != 0 || err {
        readiness |= Interest::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 || err {
        readiness |= Interest::WRITABLE;
    }
    readiness
}

impl Multiplexer for Epoll {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest_mask(interest))
    }

    fn reactivate(&self, event: &Event) -> io::Result<()> {
        // The payload is the registration mask epoll stored for us,
        // EPOLLONESHOT included.
        self.ctl(libc::EPOLL_CTL_MOD, event.ident, event.payload as u32)
    }

    fn remove(&self, event: &Event) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(
                self.ep,
                libc::EPOLL_CTL_DEL,
                event.ident,
                std::ptr::null_mut(),
            )
        };
        self.release_virtual(event.ident);
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&self, backlog: &mut Backlog, timeout: Option<Duration>) -> io::Result<usize> {
        let mut scratch = self.scratch.lock();
        scratch.resize(
            backlog.capacity(),
            libc::epoll_event { events: 0, u64: 0 },
        );

        let timeout_ms = match timeout {
            None => -1,
            Some(t) => libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX),
        };
        let n = unsafe {
            libc::epoll_wait(
                self.ep,
                scratch.as_mut_ptr(),
                libc::c_int::try_from(scratch.len()).unwrap_or(libc::c_int::MAX),
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        backlog.clear();
        for raw in &scratch[..n as usize] {
            let data = raw.u64;
            backlog.push(Event {
                ident: data as u32 as RawFd,
                readiness: fired_readiness(raw.events),
                payload: data >> 32,
            });
        }
        Ok(n as usize)
    }

    fn ident(&self) -> RawFd {
        self.ep
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn create_timer(&self, initial: Duration, interval: Option<Duration>) -> io::Result<RawFd> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // A zero it_value would disarm the timer entirely; clamp an
        // immediate expiration to one nanosecond instead.
        let value = if initial.is_zero() {
            timespec(Duration::from_nanos(1))
        } else {
            timespec(initial)
        };
        let spec = libc::itimerspec {
            it_interval: interval.map_or(timespec(Duration::ZERO), timespec),
            it_value: value,
        };
        if unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) } < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        self.virtuals.lock().insert(fd, Virtual::Timer);
        Ok(fd)
    }

    fn arm_timer(&self, ident: RawFd) -> io::Result<()> {
        self.register(ident, Interest::READABLE)
    }

    fn consume_timer(&self, event: &Event) -> io::Result<u64> {
        let mut expirations = 0u64;
        let rc = unsafe {
            libc::read(
                event.ident,
                std::ptr::addr_of_mut!(expirations).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc <= 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(expirations)
    }

    fn create_signal(&self, signo: i32) -> io::Result<RawFd> {
        let fd = unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, signo);
            libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        self.virtuals.lock().insert(fd, Virtual::Signal);
        Ok(fd)
    }

    fn arm_signal(&self, ident: RawFd) -> io::Result<()> {
        self.register(ident, Interest::READABLE)
    }

    fn consume_signal(&self, event: &Event) -> io::Result<i32> {
        let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::read(
                event.ident,
                std::ptr::addr_of_mut!(info).cast(),
                std::mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if rc <= 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(info.ssi_signo as i32)
    }
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_word_round_trips() {
        let mask = interest_mask(Interest::READABLE);
        let word = pack(17, mask);
        assert_eq!(word as u32 as RawFd, 17);
        assert_eq!((word >> 32) as u32, mask);
    }

    #[test]
    fn error_events_map_to_registered_sides() {
        let readiness = fired_readiness(libc::EPOLLERR as u32);
        assert!(readiness.is_readable());
        assert!(readiness.is_writable());
    }

    #[test]
    fn timer_descriptor_is_released_on_remove() {
        let mux = Epoll::new().expect("epoll");
        let ident = mux
            .create_timer(Duration::from_millis(5), None)
            .expect("timerfd");
        mux.arm_timer(ident).expect("arm");
        assert!(mux.virtuals.lock().contains_key(&ident));

        let event = Event {
            ident,
            readiness: Interest::READABLE,
            payload: u64::from(interest_mask(Interest::READABLE)),
        };
        mux.remove(&event).expect("remove");
        assert!(!mux.virtuals.lock().contains_key(&ident));
    }
}
