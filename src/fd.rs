//! Raw-descriptor utilities shared by the engine internals.
//!
//! The engine's tables are keyed by raw descriptor numbers, so a few
//! operations must cross from `RawFd` back into the `AsFd` world. The
//! callers uphold the invariant that a descriptor looked up in a live
//! handler or output slot stays open for the duration of the call.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

/// Borrows a raw descriptor held in an engine table.
///
/// Callers guarantee the descriptor outlives the borrow; every use is
/// confined to one dispatch or drain call for a slot that is still live.
pub(crate) fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Sets `O_NONBLOCK` on a descriptor entering the engine.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Half-closes the read side of a stream whose peer stopped reading, so a
/// stuck producer observes the death promptly.
pub(crate) fn shutdown_read(fd: RawFd) {
    unsafe { libc::shutdown(fd, libc::SHUT_RD) };
}
