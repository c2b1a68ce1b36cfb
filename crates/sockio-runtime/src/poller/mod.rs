//! Readiness poller
//!
//! A worker registers socket descriptors here and toggles read/write
//! interest as operations need it. Interest is one-shot: when readiness
//! for a wanted direction is reported the worker drops that interest
//! before delivering the event, and the consumer re-arms if it still
//! needs more.
//!
//! Readiness is not dispatched straight from the wait buffer. It is
//! folded into `WorkerFd::pending` and drained in a fixed order (read,
//! write, hangup), so removing a descriptor while its events are being
//! delivered drops whatever is still pending for it.

use std::os::unix::io::RawFd;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::Poller;
    } else {
        compile_error!("sockio-runtime supports Linux (epoll) only");
    }
}

/// Key reserved for the worker's own notifier
pub(crate) const NOTIFIER_KEY: u64 = u64::MAX;

/// Small readiness bitset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READ: Readiness = Readiness(1);
    pub const WRITE: Readiness = Readiness(2);
    pub const HANGUP: Readiness = Readiness(4);

    #[inline]
    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Readiness) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Readiness) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Remove and return the next bit in delivery order
    pub fn take_next(&mut self) -> Option<Readiness> {
        for bit in [Readiness::READ, Readiness::WRITE, Readiness::HANGUP] {
            if self.contains(bit) {
                self.remove(bit);
                return Some(bit);
            }
        }
        None
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

/// Registration record of one descriptor in a poller
#[derive(Debug)]
pub struct WorkerFd {
    pub(crate) fd: RawFd,
    pub(crate) key: u64,
    pub(crate) want_in: bool,
    pub(crate) want_out: bool,
    pub(crate) registered: bool,
    pub(crate) pending: Readiness,
}

impl WorkerFd {
    pub fn new(fd: RawFd, key: u64) -> Self {
        Self {
            fd,
            key,
            want_in: false,
            want_out: false,
            registered: false,
            pending: Readiness::EMPTY,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    #[inline]
    pub fn pending(&self) -> Readiness {
        self.pending
    }

    /// Fold readiness reported by a wait into `pending`.
    ///
    /// Only wanted directions count; hangup always does. Returns the
    /// directions whose interest must now be dropped.
    pub(crate) fn absorb(&mut self, fired: Readiness) -> Readiness {
        let mut hit = Readiness::EMPTY;
        if fired.contains(Readiness::HANGUP) {
            hit.insert(Readiness::HANGUP);
        }
        if self.want_in && fired.contains(Readiness::READ) {
            hit.insert(Readiness::READ);
        }
        if self.want_out && fired.contains(Readiness::WRITE) {
            hit.insert(Readiness::WRITE);
        }
        self.pending.insert(hit);
        let mut consumed = hit;
        consumed.remove(Readiness::HANGUP);
        consumed
    }
}
