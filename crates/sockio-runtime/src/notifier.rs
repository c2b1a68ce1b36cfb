//! `EventFdNotifier`: wakes a worker blocked in its poller.
//!
//! Any thread may `notify()`. The eventfd is registered in the worker's
//! poller; the worker `drain()`s it before emptying its mailbox, so a
//! notification sent after the drain always produces another wakeup.
//! Multiple notifications before a drain coalesce into one wakeup
//! (eventfd counter semantics).

use sockio_core::error::{AioResult, WorkerError};
use std::os::unix::io::RawFd;

use crate::sys::errno;

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a non-blocking, close-on-exec eventfd. The notifier owns it.
    pub fn create() -> AioResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(WorkerError::PollerSetup(errno()).into());
        }
        Ok(Self { fd })
    }

    /// Descriptor to register with the poller
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Signal the worker. Never blocks.
    pub fn notify(&self) {
        let val: u64 = 1;
        // EAGAIN means the counter is saturated, so a wakeup is already
        // pending. Nothing else can fail on a valid eventfd.
        unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    /// Reset the counter. Returns how many notifications were coalesced.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}
