//! Error types for the engine.
//!
//! Errors fall into the categories the engine distinguishes at runtime:
//!
//! - **Transient** (`EAGAIN`/`EINTR` on read/write/poll): retried or deferred
//!   internally, never surfaced through this type.
//! - **Connection-level** (peer closed, reset, broken pipe): terminates the
//!   affected handler only; the dispatch loop never propagates these.
//! - **Resource exhaustion** (descriptor table full): surfaced as
//!   [`Error::DescriptorLimit`] from the call that detected it.
//! - **Setup** (bind/listen/rlimit/multiplexer-init failure): surfaced as
//!   [`Error::Setup`] or [`Error::Mux`] at the call site, never swallowed.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The readiness multiplexer failed (initialization, registration, or a
    /// hard wait failure). Fatal for the operation that triggered it.
    #[error("multiplexer failure: {0}")]
    Mux(#[source] io::Error),

    /// A descriptor number does not fit the handler table sized at startup.
    #[error("descriptor {ident} exceeds the handler table capacity {capacity}")]
    DescriptorLimit {
        /// The offending descriptor number.
        ident: RawFd,
        /// The table capacity fixed at engine construction.
        capacity: usize,
    },

    /// Socket or OS setup failed (socket/bind/listen/fcntl/rlimit).
    #[error("{context}: {source}")]
    Setup {
        /// What was being set up.
        context: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The process-wide engine was used before [`crate::service::init`].
    #[error("engine is not initialized; call service::init first")]
    NotInitialized,

    /// [`crate::service::init`] was called twice.
    #[error("engine is already initialized")]
    AlreadyInitialized,

    /// Any other I/O failure surfaced by the public API.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn setup(context: &'static str, source: io::Error) -> Self {
        Self::Setup { context, source }
    }
}
