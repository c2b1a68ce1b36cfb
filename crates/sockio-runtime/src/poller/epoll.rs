//! Linux epoll backend (level-triggered, interest toggled per direction)

use super::{Readiness, WorkerFd, NOTIFIER_KEY};
use crate::sys::errno;
use sockio_core::error::{AioError, AioResult, WorkerError};
use sockio_core::kerror;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct Poller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(max_events: usize) -> AioResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(WorkerError::PollerSetup(errno()).into());
        }
        Ok(Self {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Watch the worker notifier for readability, permanently
    pub(crate) fn add_notifier(&mut self, fd: RawFd) -> AioResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32, NOTIFIER_KEY)
            .map_err(|e| WorkerError::PollerSetup(e).into())
    }

    /// Register `wfd` with whatever interest it currently wants
    pub fn add(&mut self, wfd: &mut WorkerFd) -> AioResult<()> {
        debug_assert!(!wfd.registered);
        self.ctl(libc::EPOLL_CTL_ADD, wfd.fd, interest(wfd), wfd.key)
            .map_err(AioError::Os)?;
        wfd.registered = true;
        Ok(())
    }

    /// Unregister `wfd`, dropping its interest and undelivered readiness
    pub fn remove(&mut self, wfd: &mut WorkerFd) {
        if wfd.registered {
            if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, wfd.fd, 0, wfd.key) {
                kerror!("epoll_ctl(DEL, fd {}) failed: errno {}", wfd.fd, e);
            }
        }
        wfd.registered = false;
        wfd.want_in = false;
        wfd.want_out = false;
        wfd.pending = Readiness::EMPTY;
    }

    pub fn set_in(&mut self, wfd: &mut WorkerFd) {
        if !wfd.want_in {
            wfd.want_in = true;
            self.update(wfd);
        }
    }

    pub fn reset_in(&mut self, wfd: &mut WorkerFd) {
        if wfd.want_in {
            wfd.want_in = false;
            self.update(wfd);
        }
    }

    pub fn set_out(&mut self, wfd: &mut WorkerFd) {
        if !wfd.want_out {
            wfd.want_out = true;
            self.update(wfd);
        }
    }

    pub fn reset_out(&mut self, wfd: &mut WorkerFd) {
        if wfd.want_out {
            wfd.want_out = false;
            self.update(wfd);
        }
    }

    /// Record readiness reported for `wfd` and drop the one-shot
    /// interest it consumed.
    pub(crate) fn fired(&mut self, wfd: &mut WorkerFd, fired: Readiness) {
        let consumed = wfd.absorb(fired);
        if consumed.is_empty() {
            return;
        }
        if consumed.contains(Readiness::READ) {
            wfd.want_in = false;
        }
        if consumed.contains(Readiness::WRITE) {
            wfd.want_out = false;
        }
        self.update(wfd);
    }

    /// Wait up to `timeout` and append `(key, readiness)` pairs to `out`.
    ///
    /// An interrupted wait returns with nothing ready.
    pub fn wait(&mut self, timeout: Duration, out: &mut Vec<(u64, Readiness)>) -> AioResult<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let e = errno();
            if e == libc::EINTR {
                return Ok(());
            }
            return Err(AioError::Os(e));
        }
        for ev in &self.events[..n as usize] {
            let bits = ev.events;
            let key = ev.u64;
            let mut ready = Readiness::EMPTY;
            if bits & libc::EPOLLIN as u32 != 0 {
                ready.insert(Readiness::READ);
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                ready.insert(Readiness::WRITE);
            }
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                ready.insert(Readiness::HANGUP);
            }
            out.push((key, ready));
        }
        Ok(())
    }

    /// Apply the current interest of a registered fd. A failing MOD on a
    /// descriptor we own leaves the loop in an unknown state, so it is fatal.
    fn update(&mut self, wfd: &WorkerFd) {
        if !wfd.registered {
            return;
        }
        if let Err(e) = self.ctl(libc::EPOLL_CTL_MOD, wfd.fd, interest(wfd), wfd.key) {
            kerror!("epoll_ctl(MOD, fd {}) failed: errno {}", wfd.fd, e);
            std::process::abort();
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> Result<(), i32> {
        let mut ev = libc::epoll_event { events, u64: key };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            Err(errno())
        } else {
            Ok(())
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn interest(wfd: &WorkerFd) -> u32 {
    let mut events = 0u32;
    if wfd.want_in {
        events |= libc::EPOLLIN as u32;
    }
    if wfd.want_out {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
    if timeout.is_zero() {
        return 0;
    }
    let ms = timeout.as_millis().max(1);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::close_fd;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_read_interest_is_one_shot() {
        let mut poller = Poller::new(8).unwrap();
        let (rd, wr) = pipe();
        let mut wfd = WorkerFd::new(rd, 42);
        poller.add(&mut wfd).unwrap();
        poller.set_in(&mut wfd);

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) }, 1);

        let mut out = Vec::new();
        poller.wait(Duration::from_millis(500), &mut out).unwrap();
        assert_eq!(out, vec![(42, Readiness::READ)]);

        poller.fired(&mut wfd, out[0].1);
        assert!(!wfd.want_in);
        assert_eq!(wfd.pending(), Readiness::READ);

        // Data is still unread, but interest was consumed.
        out.clear();
        poller.wait(Duration::from_millis(10), &mut out).unwrap();
        assert!(out.is_empty());

        poller.remove(&mut wfd);
        assert!(wfd.pending().is_empty());
        assert!(!wfd.is_registered());
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_write_interest() {
        let mut poller = Poller::new(8).unwrap();
        let (rd, wr) = pipe();
        let mut wfd = WorkerFd::new(wr, 7);
        wfd.want_out = true;
        poller.add(&mut wfd).unwrap();

        let mut out = Vec::new();
        poller.wait(Duration::from_millis(500), &mut out).unwrap();
        assert_eq!(out, vec![(7, Readiness::WRITE)]);

        poller.reset_out(&mut wfd);
        out.clear();
        poller.wait(Duration::ZERO, &mut out).unwrap();
        assert!(out.is_empty());

        poller.remove(&mut wfd);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_timeout_rounding() {
        assert_eq!(timeout_ms(Duration::ZERO), 0);
        assert_eq!(timeout_ms(Duration::from_micros(10)), 1);
        assert_eq!(timeout_ms(Duration::from_millis(250)), 250);
    }
}
