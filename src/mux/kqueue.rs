//! BSD/macOS kqueue-based multiplexer.
//!
//! This backend uses kqueue in oneshot mode (`EV_ONESHOT`). Timers and
//! signals use the native `EVFILT_TIMER`/`EVFILT_SIGNAL` filters; since
//! those have no descriptor of their own, idents for them are allocated
//! from a [`SlotTable`] above the process descriptor range so they can
//! share the handler table with real descriptors.
//!
//! # Safety
//!
//! This module interfaces with kqueue through `libc`. The compiler cannot
//! verify descriptor validity across registration; [`Kqueue`] maintains the
//! invariant by owning the kqueue descriptor and by handing out synthetic
//! idents only while their slot is live.

#![allow(unsafe_code)]

use crate::mux::slot::SlotTable;
use crate::mux::{Backlog, Event, Interest, Multiplexer, descriptor_limit};

use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Maximum simultaneously-live synthetic timer/signal idents.
const MAX_VIRTUAL: usize = 256;

// Payload tags identifying how to re-arm or release a fired event.
const KIND_READ: u64 = 0;
const KIND_WRITE: u64 = 1;
const KIND_TIMER: u64 = 2;
const KIND_SIGNAL: u64 = 3;

#[derive(Debug, Clone, Copy)]
enum Virtual {
    Timer {
        initial_ms: u64,
        interval_ms: Option<u64>,
    },
    Signal {
        signo: i32,
    },
}

/// BSD kqueue backend with oneshot semantics.
pub struct Kqueue {
    kq: RawFd,
    virtuals: Mutex<SlotTable<Virtual>>,
    scratch: Mutex<Vec<libc::kevent>>,
    fd_capacity: usize,
}

impl Kqueue {
    /// Creates a new kqueue instance.
    ///
    /// # Errors
    ///
    /// Returns an error if `kqueue()` or the descriptor-limit probe fails.
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_capacity = match descriptor_limit() {
            Ok(n) => n,
            Err(e) => {
                unsafe { libc::close(kq) };
                return Err(e);
            }
        };
        Ok(Self {
            kq,
            virtuals: Mutex::new(SlotTable::new(fd_capacity, MAX_VIRTUAL)),
            scratch: Mutex::new(Vec::new()),
            fd_capacity,
        })
    }

    fn change(&self, kev: libc::kevent) -> io::Result<()> {
        let rc = unsafe { libc::kevent(self.kq, &kev, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn arm_timer_ms(&self, ident: RawFd, ms: u64) -> io::Result<()> {
        self.change(kev(
            ident as usize,
            libc::EVFILT_TIMER,
            libc::EV_ADD | libc::EV_ONESHOT,
            0,
            isize::try_from(ms).unwrap_or(isize::MAX),
            0,
        ))
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

fn kev(
    ident: usize,
    filter: i16,
    flags: u16,
    fflags: u32,
    data: isize,
    udata: usize,
) -> libc::kevent {
    // Field-by-field init keeps this portable across BSDs whose kevent
    // structs carry extra members.
    let mut k: libc::kevent = unsafe { std::mem::zeroed() };
    k.ident = ident as libc::uintptr_t;
    k.filter = filter;
    k.flags = flags;
    k.fflags = fflags;
    k.data = data as _;
    k.udata = udata as *mut libc::c_void;
    k
}

fn whole_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl Multiplexer for Kqueue {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_readable() {
            self.change(kev(
                fd as usize,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_ONESHOT,
                0,
                0,
                0,
            ))?;
        }
        if interest.is_writable() {
            self.change(kev(
                fd as usize,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_ONESHOT,
                0,
                0,
                0,
            ))?;
        }
        Ok(())
    }

    fn reactivate(&self, event: &Event) -> io::Result<()> {
        match event.payload & 0xf {
            KIND_READ => self.register(event.ident, Interest::READABLE),
            KIND_WRITE => self.register(event.ident, Interest::WRITABLE),
            KIND_TIMER => {
                let entry = self.virtuals.lock().get(event.ident as usize).copied();
                match entry {
                    Some(Virtual::Timer {
                        initial_ms,
                        interval_ms,
                    }) => self.arm_timer_ms(event.ident, interval_ms.unwrap_or(initial_ms)),
                    _ => Err(io::Error::from(io::ErrorKind::NotFound)),
                }
            }
            KIND_SIGNAL => {
                let signo = (event.payload >> 32) as i32;
                self.change(kev(
                    signo as usize,
                    libc::EVFILT_SIGNAL,
                    libc::EV_ADD | libc::EV_ONESHOT,
                    0,
                    0,
                    event.ident as usize,
                ))
            }
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }

    fn remove(&self, event: &Event) -> io::Result<()> {
        // Oneshot fd filters delete themselves on delivery; only synthetic
        // idents hold a slot to release.
        match event.payload & 0xf {
            KIND_TIMER | KIND_SIGNAL => {
                self.virtuals.lock().release(event.ident as usize);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn wait(&self, backlog: &mut Backlog, timeout: Option<Duration>) -> io::Result<usize> {
        let mut scratch = self.scratch.lock();
        scratch.resize(backlog.capacity(), kev(0, 0, 0, 0, 0, 0));

        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                scratch.as_mut_ptr(),
                libc::c_int::try_from(scratch.len()).unwrap_or(libc::c_int::MAX),
                ts.as_ref()
                    .map_or(std::ptr::null(), |t| t as *const libc::timespec),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        backlog.clear();
        for raw in &scratch[..n as usize] {
            let event = match raw.filter {
                libc::EVFILT_READ => Event {
                    ident: raw.ident as RawFd,
                    readiness: Interest::READABLE,
                    payload: KIND_READ,
                },
                libc::EVFILT_WRITE => Event {
                    ident: raw.ident as RawFd,
                    readiness: Interest::WRITABLE,
                    payload: KIND_WRITE,
                },
                libc::EVFILT_TIMER => Event {
                    ident: raw.ident as RawFd,
                    readiness: Interest::READABLE,
                    payload: KIND_TIMER | ((raw.data as u64) << 32),
                },
                libc::EVFILT_SIGNAL => Event {
                    // The kevent ident is the signal number; the synthetic
                    // handler-table ident travels in udata.
                    ident: raw.udata as usize as RawFd,
                    readiness: Interest::READABLE,
                    payload: KIND_SIGNAL | ((raw.ident as u64) << 32),
                },
                _ => continue,
            };
            backlog.push(event);
        }
        Ok(backlog.len())
    }

    fn ident(&self) -> RawFd {
        self.kq
    }

    fn capacity(&self) -> usize {
        self.fd_capacity + MAX_VIRTUAL
    }

    fn create_timer(&self, initial: Duration, interval: Option<Duration>) -> io::Result<RawFd> {
        let entry = Virtual::Timer {
            initial_ms: whole_ms(initial),
            interval_ms: interval.map(whole_ms),
        };
        let ident = self
            .virtuals
            .lock()
            .alloc(entry)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(ident as RawFd)
    }

    fn arm_timer(&self, ident: RawFd) -> io::Result<()> {
        let entry = self.virtuals.lock().get(ident as usize).copied();
        match entry {
            Some(Virtual::Timer { initial_ms, .. }) => self.arm_timer_ms(ident, initial_ms),
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn consume_timer(&self, event: &Event) -> io::Result<u64> {
        // kqueue reports the expiration count in the event itself; there is
        // no descriptor to drain.
        Ok(event.payload >> 32)
    }

    fn create_signal(&self, signo: i32) -> io::Result<RawFd> {
        let ident = self
            .virtuals
            .lock()
            .alloc(Virtual::Signal { signo })
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(ident as RawFd)
    }

    fn arm_signal(&self, ident: RawFd) -> io::Result<()> {
        let entry = self.virtuals.lock().get(ident as usize).copied();
        match entry {
            Some(Virtual::Signal { signo }) => self.change(kev(
                signo as usize,
                libc::EVFILT_SIGNAL,
                libc::EV_ADD | libc::EV_ONESHOT,
                0,
                0,
                ident as usize,
            )),
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn consume_signal(&self, event: &Event) -> io::Result<i32> {
        Ok((event.payload >> 32) as i32)
    }
}
