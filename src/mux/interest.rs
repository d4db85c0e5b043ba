//! Interest flags for readiness registration.
//!
//! Every registration is oneshot: after the interest fires once the
//! descriptor is inert until explicitly reactivated, so [`Interest`] only
//! needs to say *what* to watch, never *how*.
//!
//! # Platform mapping
//!
//! | Interest | epoll | kqueue |
//! |----------|-------|--------|
//! | READABLE | `EPOLLIN` | `EVFILT_READ` |
//! | WRITABLE | `EPOLLOUT` | `EVFILT_WRITE` |

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Interest in readiness events.
///
/// Combine with the `|` operator:
///
/// ```
/// use swell::Interest;
///
/// let interest = Interest::READABLE | Interest::WRITABLE;
/// assert!(interest.is_readable());
/// assert!(interest.is_writable());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Interest(u8);

impl Interest {
    /// No interest (empty set).
    pub const NONE: Self = Self(0);

    /// Interested in read readiness.
    pub const READABLE: Self = Self(1 << 0);

    /// Interested in write readiness.
    pub const WRITABLE: Self = Self(1 << 1);

    /// Returns true if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns true if read readiness is requested.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    /// Returns true if write readiness is requested.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = f.debug_set();
        if self.is_readable() {
            parts.entry(&"READABLE");
        }
        if self.is_writable() {
            parts.entry(&"WRITABLE");
        }
        parts.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.contains(Interest::READABLE));
        assert!(both.contains(Interest::WRITABLE));
        assert!(!Interest::READABLE.contains(both));
    }

    #[test]
    fn empty_set() {
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::NONE.is_readable());
    }
}
