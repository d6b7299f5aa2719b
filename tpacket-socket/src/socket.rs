//
// socket.rs - Bound TPACKET_V3 Capture Socket
//
// Purpose:
//   This module provides the socket a capture worker reads from: an AF_PACKET socket bound to
//   one interface, with a TPACKET_V3 receive ring mapped into the process.
//
// How it works:
//   - The socket owns its descriptor and its ring mapping; both are released when it is
//     closed or dropped, mapping first.
//   - Blocks are taken strictly in ring order. The rotation index only moves forward once the
//     block under it is user-owned, so a block is never handed out twice before the kernel has
//     refilled it.
//   - When the current block is still kernel-owned, `next_block` waits on the descriptor with
//     `poll`, bounded by the caller's timeout, and reports "no block yet" if it stays that way.
//
// Main components:
//   - CaptureSocket: bound socket plus ring, built by `CaptureSocketBuilder::bind`.
//   - SocketStats: kernel counters read with PACKET_STATISTICS.
//

use crate::block::BlockView;
use crate::config::RingConfig;
use crate::error::PollError;
use crate::mmap::RingMapping;
use crate::poll::wait_readable;
use crate::ring::{PACKET_STATISTICS, TpacketStatsV3};
use crate::source::BlockSource;
use std::io;
use std::os::fd::{AsFd as _, AsRawFd as _, BorrowedFd, OwnedFd};
use std::time::Duration;

/// Kernel counters for one socket since the previous read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Packets that reached the socket, dropped ones included.
    pub packets: u64,
    /// Packets dropped because no block was free.
    pub drops: u64,
    /// Times the ring was frozen because every block was user-owned.
    pub freeze_count: u64,
}

pub struct CaptureSocket {
    // Declared before `fd` so the ring is unmapped before the socket closes.
    mapping: Option<RingMapping>,
    fd: Option<OwnedFd>,
    interface: String,
    if_index: u32,
    ring: RingConfig,
    current: usize,
}

impl CaptureSocket {
    pub(crate) fn new(
        fd: OwnedFd,
        mapping: RingMapping,
        interface: &str,
        if_index: u32,
        ring: RingConfig,
    ) -> Self {
        CaptureSocket {
            mapping: Some(mapping),
            fd: Some(fd),
            interface: interface.to_string(),
            if_index,
            ring,
            current: 0,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn ring(&self) -> &RingConfig {
        &self.ring
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    pub(crate) fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Waits up to `timeout` for the next block in ring order.
    ///
    /// # Returns
    /// `Ok(Some(block))` when the block is user-owned, `Ok(None)` when the timeout elapsed
    /// (or the wait was interrupted) first. The view borrows the socket, so it has to be
    /// retired before another block can be taken.
    ///
    /// # Errors
    /// `PollError::Closed` after `close`, `PollError::Wait` if `poll` itself fails.
    pub fn next_block(&mut self, timeout: Duration) -> Result<Option<BlockView<'_>>, PollError> {
        let (Some(fd), Some(mapping)) = (self.fd.as_ref(), self.mapping.as_mut()) else {
            return Err(PollError::Closed);
        };
        let index = self.current;
        if !mapping.is_user_owned(index)
            && !(wait_readable(fd.as_fd(), timeout)? && mapping.is_user_owned(index))
        {
            return Ok(None);
        }
        self.current = (index + 1) % mapping.block_count();
        Ok(Some(BlockView::new(mapping, index)))
    }

    /// Reads and resets the kernel's counters for this socket.
    pub fn statistics(&self) -> io::Result<SocketStats> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut stats = TpacketStatsV3::default();
        let mut optlen = size_of::<TpacketStatsV3>() as libc::socklen_t;
        unsafe {
            if libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                &mut stats as *mut _ as *mut libc::c_void,
                &mut optlen,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(SocketStats {
            packets: stats.tp_packets as u64,
            drops: stats.tp_drops as u64,
            freeze_count: stats.tp_freeze_q_cnt as u64,
        })
    }

    /// Unmaps the ring and closes the socket. Calling it again does nothing.
    pub fn close(&mut self) {
        let unmapped = self.mapping.take().is_some();
        let closed = self.fd.take().is_some();
        if unmapped || closed {
            log::debug!("Closed capture socket on {}", self.interface);
        }
    }
}

impl BlockSource for CaptureSocket {
    fn next_block(&mut self, timeout: Duration) -> Result<Option<BlockView<'_>>, PollError> {
        CaptureSocket::next_block(self, timeout)
    }

    fn block_size(&self) -> usize {
        self.ring.block_size as usize
    }

    fn statistics(&self) -> Option<SocketStats> {
        match CaptureSocket::statistics(self) {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::warn!("Failed to read socket statistics on {}: {e}", self.interface);
                None
            }
        }
    }
}
