//! Transfer queue: ordered, owned output segments for one descriptor.
//!
//! An [`Xfer`] is the unit of queued output. Segments are typed and own
//! their payload: a memory span, a vector of spans, a file region to send,
//! or a finalizer to run once everything before it was delivered. Segments
//! are never reordered; short writes trim the front segment in place.
//!
//! A [`Finalizer`] fires exactly once: on consumption when its segment is
//! reached, or on drop when the queue is abandoned. The exactly-once
//! completion guarantee falls out of ownership.

use bytes::{Buf, Bytes};
use nix::errno::Errno;
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, IoSlice};
use std::os::fd::BorrowedFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Largest iovec batch handed to one `writev` call.
const MAX_IOV: usize = 1024;

/// Completion callback that fires exactly once.
///
/// Fires when its segment is consumed by a successful write, or on drop
/// when the owning queue is reset after an error or close.
pub struct Finalizer(Option<Box<dyn FnOnce() + Send>>);

impl Finalizer {
    /// Wraps a callback.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            // A panicking completion callback must not take down the
            // dispatch loop or a queue reset.
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                tracing::warn!("finalizer panicked");
            }
        }
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Finalizer")
            .field(&self.0.as_ref().map(|_| "pending"))
            .finish()
    }
}

/// One typed output segment.
#[derive(Debug)]
pub(crate) enum Segment {
    /// A contiguous byte span.
    Memory(Bytes),
    /// A scatter list written with one `writev` per attempt.
    Vector(Vec<Bytes>),
    /// A file region transmitted with `sendfile`.
    File {
        file: Arc<File>,
        offset: u64,
        len: usize,
    },
    /// A completion callback; consumed without touching the descriptor.
    Finalize(Finalizer),
}

/// Outcome of one drain pass over a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drain {
    /// Every segment was consumed.
    Complete,
    /// The descriptor stopped accepting bytes; re-arm write readiness.
    Blocked,
}

/// An ordered queue of pending output segments.
///
/// Callers build an `Xfer` and hand it to
/// [`Reactor::commit`](crate::Reactor::commit), which merges it onto the
/// descriptor's live queue atomically. Dropping an `Xfer` with queued
/// finalizers fires them (the abandonment path).
#[derive(Debug, Default)]
pub struct Xfer {
    segments: VecDeque<Segment>,
}

impl Xfer {
    /// Creates an empty transfer batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a memory span.
    pub fn push_write(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if !data.is_empty() {
            self.segments.push_back(Segment::Memory(data));
        }
    }

    /// Appends a scatter list, written as one vectored write.
    pub fn push_writev(&mut self, bufs: impl IntoIterator<Item = Bytes>) {
        let bufs: Vec<Bytes> = bufs.into_iter().filter(|b| !b.is_empty()).collect();
        if !bufs.is_empty() {
            self.segments.push_back(Segment::Vector(bufs));
        }
    }

    /// Appends a file region to transmit with `sendfile`.
    pub fn push_send_file(&mut self, file: Arc<File>, offset: u64, len: usize) {
        if len > 0 {
            self.segments.push_back(Segment::File { file, offset, len });
        }
    }

    /// Appends a completion callback that fires once everything queued
    /// before it was delivered (or the queue was abandoned).
    pub fn push_finalize(&mut self, f: impl FnOnce() + Send + 'static) {
        self.segments.push_back(Segment::Finalize(Finalizer::new(f)));
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Drops every queued segment; pending finalizers fire.
    pub fn reset(&mut self) {
        self.segments.clear();
    }

    /// Moves every segment onto the tail of `to`, preserving order.
    pub(crate) fn migrate(&mut self, to: &mut Xfer) {
        to.segments.append(&mut self.segments);
    }

    /// Attempts to write the queue front-to-back.
    ///
    /// Consumed segments are popped; a short write trims the front segment
    /// in place and stops. `EAGAIN`/`EINTR` report [`Drain::Blocked`]; any
    /// other failure (including a zero-length write) is an error, and the
    /// caller is responsible for resetting the queue.
    pub(crate) fn drain(&mut self, fd: BorrowedFd<'_>) -> io::Result<Drain> {
        while let Some(front) = self.segments.front_mut() {
            match front {
                Segment::Memory(data) => {
                    let n = match write_once(fd, &[IoSlice::new(data)])? {
                        Written::Blocked => return Ok(Drain::Blocked),
                        Written::Bytes(n) => n,
                    };
                    if n < data.len() {
                        data.advance(n);
                        return Ok(Drain::Blocked);
                    }
                }
                Segment::Vector(bufs) => {
                    let iov: Vec<IoSlice<'_>> = bufs
                        .iter()
                        .take(MAX_IOV)
                        .map(|b| IoSlice::new(b))
                        .collect();
                    let total: usize = iov.iter().map(|s| s.len()).sum();
                    let n = match write_once(fd, &iov)? {
                        Written::Blocked => return Ok(Drain::Blocked),
                        Written::Bytes(n) => n,
                    };
                    advance_bufs(bufs, n);
                    if !bufs.is_empty() {
                        if n < total {
                            return Ok(Drain::Blocked);
                        }
                        // A full iovec batch went through; more slices remain.
                        continue;
                    }
                }
                Segment::File { file, offset, len } => {
                    match send_file_once(fd, file, *offset, *len) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "sendfile source exhausted before the queued length",
                            ));
                        }
                        Ok(n) if n < *len => {
                            *offset += n as u64;
                            *len -= n;
                            return Ok(Drain::Blocked);
                        }
                        Ok(_) => {}
                        Err(e) if blocked(&e) => return Ok(Drain::Blocked),
                        Err(e) => return Err(e),
                    }
                }
                Segment::Finalize(_) => {}
            }
            // Fully consumed; dropping a finalizer segment fires it.
            self.segments.pop_front();
        }
        Ok(Drain::Complete)
    }
}

enum Written {
    Bytes(usize),
    Blocked,
}

fn write_once(fd: BorrowedFd<'_>, iov: &[IoSlice<'_>]) -> io::Result<Written> {
    match nix::sys::uio::writev(fd, iov) {
        Ok(0) => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "descriptor accepted no bytes",
        )),
        Ok(n) => Ok(Written::Bytes(n)),
        Err(Errno::EAGAIN | Errno::EINTR) => Ok(Written::Blocked),
        Err(e) => Err(io::Error::from(e)),
    }
}

fn blocked(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Trims `n` delivered bytes off the front of a scatter list.
fn advance_bufs(bufs: &mut Vec<Bytes>, mut n: usize) {
    while n > 0 {
        let front_len = bufs[0].len();
        if n >= front_len {
            bufs.remove(0);
            n -= front_len;
        } else {
            bufs[0].advance(n);
            break;
        }
    }
}

#[cfg(target_os = "linux")]
fn send_file_once(fd: BorrowedFd<'_>, file: &File, offset: u64, len: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    nix::sys::sendfile::sendfile(fd, file, Some(&mut off), len).map_err(io::Error::from)
}

#[cfg(target_os = "macos")]
fn send_file_once(fd: BorrowedFd<'_>, file: &File, offset: u64, len: usize) -> io::Result<usize> {
    let (result, sent) = nix::sys::sendfile::sendfile(
        file,
        fd,
        offset as libc::off_t,
        Some(len as libc::off_t),
        None,
        None,
    );
    match result {
        Ok(()) => Ok(sent as usize),
        // Partial progress before EAGAIN still counts.
        Err(Errno::EAGAIN | Errno::EINTR) if sent > 0 => Ok(sent as usize),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn send_file_once(fd: BorrowedFd<'_>, file: &File, offset: u64, len: usize) -> io::Result<usize> {
    // No zero-copy primitive on this platform; fall back to a bounded copy.
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len.min(64 * 1024)];
    let n = file.read_at(&mut buf, offset)?;
    if n == 0 {
        return Ok(0);
    }
    match write_once(fd, &[IoSlice::new(&buf[..n])])? {
        Written::Bytes(n) => Ok(n),
        Written::Blocked => Err(io::Error::from(io::ErrorKind::WouldBlock)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        a.set_nonblocking(true).expect("nonblocking");
        (a, b)
    }

    #[test]
    fn drains_segments_in_order() {
        let (a, mut b) = pair();
        let mut xf = Xfer::new();
        xf.push_write(&b"hello"[..]);
        xf.push_writev([Bytes::from_static(b" "), Bytes::from_static(b"world")]);

        assert_eq!(xf.drain(a.as_fd()).unwrap(), Drain::Complete);
        assert!(xf.is_empty());

        let mut got = [0u8; 11];
        b.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello world");
    }

    #[test]
    fn short_write_blocks_and_resumes() {
        let (a, mut b) = pair();
        // Far larger than any default socket buffer.
        let payload = Bytes::from(vec![7u8; 8 * 1024 * 1024]);
        let mut xf = Xfer::new();
        xf.push_write(payload.clone());

        assert_eq!(xf.drain(a.as_fd()).unwrap(), Drain::Blocked);
        assert!(!xf.is_empty());

        b.set_nonblocking(false).unwrap();
        let mut received = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        while received.len() < payload.len() {
            match b.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    // Keep pushing the remainder as space frees up.
                    if !xf.is_empty() {
                        let _ = xf.drain(a.as_fd()).unwrap();
                    }
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(received.len(), payload.len());
        assert!(xf.is_empty());
    }

    #[test]
    fn finalizer_fires_once_on_consumption() {
        let (a, _b) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut xf = Xfer::new();
        xf.push_write(&b"x"[..]);
        let counter = Arc::clone(&fired);
        xf.push_finalize(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(xf.drain(a.as_fd()).unwrap(), Drain::Complete);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(xf);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finalizer_fires_once_on_reset() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut xf = Xfer::new();
        let counter = Arc::clone(&fired);
        xf.push_finalize(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        xf.reset();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        xf.reset();
        drop(xf);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn migrate_preserves_order() {
        let mut src = Xfer::new();
        src.push_write(&b"bb"[..]);
        let mut dst = Xfer::new();
        dst.push_write(&b"aa"[..]);

        src.migrate(&mut dst);
        assert!(src.is_empty());

        let (a, mut b) = pair();
        assert_eq!(dst.drain(a.as_fd()).unwrap(), Drain::Complete);
        let mut got = [0u8; 4];
        b.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"aabb");
    }

    #[test]
    fn vector_trim_keeps_unsent_tail() {
        let mut bufs = vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"def"),
            Bytes::from_static(b"ghi"),
        ];
        advance_bufs(&mut bufs, 4);
        assert_eq!(bufs.len(), 2);
        assert_eq!(&bufs[0][..], b"ef");
        assert_eq!(&bufs[1][..], b"ghi");
    }
}
