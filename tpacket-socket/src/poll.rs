//!
//! # Capture Socket Poll Utilities
//!
//! This file provides the readiness wait a capture socket blocks in while the kernel owns the
//! next block of the ring. A packet socket with an RX ring reports `POLLIN` as soon as any
//! block has been handed to userspace, either because it filled or because its retire timer
//! expired.
//!
//! ## How it works
//!
//! `wait_readable` calls `poll` once on the descriptor with the caller's timeout. A timeout
//! and an interrupted call (`EINTR`) both report "not ready" rather than an error, so the
//! caller gets a chance to look at its shutdown flag. A failure of `poll` itself, a
//! descriptor the kernel reports as invalid, and a pending socket error are errors.
//!
//! The kernel raises `POLLERR` until the socket's error is read, for example `ENETDOWN`
//! once the bound interface goes away. The error is taken with `SO_ERROR`, which clears
//! it, and returned, so a dead socket stops its worker instead of waking it forever.
//!
//! A non-zero timeout is rounded up to whole milliseconds; only `Duration::ZERO` polls
//! without blocking.
//!
//! ## Main components
//!
//! - `wait_readable()`: bounded readiness wait on a raw descriptor.
//! - `CaptureSocket::poll()`: the same wait on a socket's own descriptor.
//!

use crate::error::PollError;
use crate::socket::CaptureSocket;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd as _, BorrowedFd};
use std::time::Duration;

/// Waits up to `timeout` for `fd` to become readable.
///
/// # Returns
/// `Ok(true)` if the descriptor is readable, `Ok(false)` on timeout or interruption, and
/// `PollError::Wait` carrying the socket's pending error if one was raised.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool, PollError> {
    let mut fds = [libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN | libc::POLLERR,
        revents: 0,
    }];
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, poll_millis(timeout)) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(false);
        }
        return Err(PollError::Wait(err));
    }
    let revents = fds[0].revents;
    if revents & libc::POLLNVAL != 0 {
        return Err(PollError::Wait(io::Error::from_raw_os_error(libc::EBADF)));
    }
    if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        match take_socket_error(fd)? {
            0 => {}
            errno => return Err(PollError::Wait(io::Error::from_raw_os_error(errno))),
        }
    }
    Ok(ret > 0 && revents & libc::POLLIN != 0)
}

fn poll_millis(timeout: Duration) -> libc::c_int {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    millis.min(libc::c_int::MAX as u128) as libc::c_int
}

/// Reads and clears the socket's pending error.
fn take_socket_error(fd: BorrowedFd<'_>) -> Result<libc::c_int, PollError> {
    let mut errno: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errno as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(PollError::Wait(io::Error::last_os_error()));
    }
    Ok(errno)
}

impl CaptureSocket {
    /// Waits for the socket to report a user-owned block, without taking it.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Longest time to block.
    ///
    /// # Returns
    ///
    /// `Ok(true)` when a block is ready, `Ok(false)` on timeout.
    pub fn poll(&self, timeout: Duration) -> Result<bool, PollError> {
        match self.fd() {
            Some(fd) => wait_readable(fd, timeout),
            None => Err(PollError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd as _;
    use std::net::UdpSocket;
use std::os::unix::net::UnixDatagram;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out() {
        let (a, _b) = UnixDatagram::pair().unwrap();
        let start = Instant::now();
        let ready = wait_readable(a.as_fd(), Duration::from_millis(20)).unwrap();
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_sub_millisecond_timeout_still_blocks() {
        assert_eq!(poll_millis(Duration::ZERO), 0);
        assert_eq!(poll_millis(Duration::from_micros(1)), 1);
        assert_eq!(poll_millis(Duration::from_micros(1500)), 2);
        assert_eq!(poll_millis(Duration::from_secs(1)), 1000);

        let (a, _b) = UnixDatagram::pair().unwrap();
        assert!(!wait_readable(a.as_fd(), Duration::from_micros(10)).unwrap());
    }

    #[test]
    fn test_pending_socket_error_is_reported_once() {
        // A datagram to a closed port draws an ICMP port unreachable, which leaves
        // ECONNREFUSED pending on the connected sender.
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = closed.local_addr().unwrap();
        drop(closed);
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(target).unwrap();
        sender.send(b"nobody listens").unwrap();

        match wait_readable(sender.as_fd(), Duration::from_secs(1)) {
            Err(PollError::Wait(e)) => {
                assert_eq!(e.raw_os_error(), Some(libc::ECONNREFUSED))
            }
            other => panic!("unexpected wait result {other:?}"),
        }
        // Reading the error cleared it, so the next wait blocks for its full timeout.
        let start = Instant::now();
        assert!(!wait_readable(sender.as_fd(), Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wait_sees_readable() {
        let (a, b) = UnixDatagram::pair().unwrap();
        b.send(b"ready").unwrap();
        assert!(wait_readable(a.as_fd(), Duration::from_secs(1)).unwrap());
    }
}
