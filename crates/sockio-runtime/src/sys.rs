//! Thin libc helpers shared by the poller, notifier and usock

use std::os::unix::io::RawFd;

/// errno of the last failed libc call on this thread
#[inline]
pub(crate) fn errno() -> i32 {
    nix::errno::Errno::last() as i32
}

/// True for the errno values meaning "try again later"
#[inline]
pub(crate) fn would_block(e: i32) -> bool {
    e == libc::EAGAIN || e == libc::EWOULDBLOCK
}

/// Close `fd`, ignoring errors. EINTR is not retried on Linux: the
/// descriptor is released either way.
#[inline]
pub(crate) fn close_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Pending socket error (`SO_ERROR`), clearing it.
pub(crate) fn take_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        errno()
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_after_bad_close() {
        let rc = unsafe { libc::close(-1) };
        assert_eq!(rc, -1);
        assert_eq!(errno(), libc::EBADF);
    }

    #[test]
    fn test_would_block() {
        assert!(would_block(libc::EAGAIN));
        assert!(!would_block(libc::ECONNRESET));
    }

    #[test]
    fn test_socket_error_on_fresh_socket() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        assert_eq!(take_socket_error(fd), 0);
        close_fd(fd);
    }
}
