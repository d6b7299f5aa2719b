//! # Memory Mapping for the Packet Ring
//!
//! ## Purpose
//!
//! This module provides the owner of the memory region a `PACKET_RX_RING` lives in. The
//! kernel writes captured frames into it and userspace reads them in place, so this is the
//! piece that makes capture zero-copy.
//!
//! ## How it works
//!
//! `RingMapping` encapsulates the raw pointer returned by `libc::mmap`, the total size and
//! the block geometry the region is divided into. It is created either over a packet socket
//! (`MAP_SHARED` on the fd, the real ring) or over anonymous memory (a stand-in ring with the
//! same layout, used by the synthetic source). `Drop` calls `libc::munmap`, so the region is
//! released on every path, including a half-finished socket setup.
//!
//! ## Main components
//!
//! - `RingMapping`: owner of the mapped region, hands out per-block pointers and status words.
//! - `page_size()`: the system page size that block sizes must be a multiple of.

use crate::ring::{BLOCK_STATUS_OFFSET, TP_STATUS_USER};
use std::os::fd::{AsRawFd as _, BorrowedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::{io, ptr, slice};

/// Returns the system page size in bytes.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Owner of a memory-mapped ring divided into `block_count` blocks of `block_size` bytes.
///
/// The mapping is never exposed as a whole; readers go through `BlockView`, which
/// bounds-checks every offset it takes from the kernel-written headers.
pub struct RingMapping {
    ptr: *mut libc::c_void,
    len: usize,
    block_size: usize,
    block_count: usize,
}

// SAFETY: the region is owned by exactly one socket (or synthetic ring) and only ever touched
// from the thread that owns it; the kernel side synchronises through the block status word.
unsafe impl Send for RingMapping {}

impl RingMapping {
    /// Maps the RX ring previously registered on `fd` with `PACKET_RX_RING`.
    ///
    /// The ring pages are allocated and pinned by the kernel when the ring is registered,
    /// so the mapping does not need `MAP_LOCKED`.
    pub fn map_socket(
        fd: BorrowedFd<'_>,
        block_size: usize,
        block_count: usize,
    ) -> io::Result<Self> {
        let len = ring_len(block_size, block_count)?;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_NORESERVE,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(RingMapping {
            ptr,
            len,
            block_size,
            block_count,
        })
    }

    /// Creates a zero-filled anonymous region with the same geometry as a real ring.
    ///
    /// Every block starts out kernel-owned (status word zero).
    pub fn anonymous(block_size: usize, block_count: usize) -> io::Result<Self> {
        let len = ring_len(block_size, block_count)?;
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(RingMapping {
            ptr,
            len,
            block_size,
            block_count,
        })
    }

    /// Returns the size of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapped region has a size of zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Returns the first byte of block `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a block of this ring.
    pub(crate) fn block_ptr(&self, index: usize) -> *mut u8 {
        assert!(
            index < self.block_count,
            "block {index} out of range for a ring of {} blocks",
            self.block_count
        );
        unsafe { (self.ptr as *mut u8).add(index * self.block_size) }
    }

    /// Returns the status word of block `index`, shared with the kernel.
    pub(crate) fn block_status(&self, index: usize) -> &AtomicU32 {
        // Blocks are page aligned and the status word sits at a 4-byte aligned offset.
        unsafe { &*(self.block_ptr(index).add(BLOCK_STATUS_OFFSET) as *const AtomicU32) }
    }

    /// Returns `true` once the kernel has handed block `index` to userspace.
    pub fn is_user_owned(&self, index: usize) -> bool {
        self.block_status(index).load(Ordering::Acquire) & TP_STATUS_USER != 0
    }

    /// Returns the bytes of block `index` for writing.
    ///
    /// Only the producer side of an anonymous ring writes through this; a real ring is
    /// written by the kernel.
    pub(crate) fn block_mut(&mut self, index: usize) -> &mut [u8] {
        let ptr = self.block_ptr(index);
        unsafe { slice::from_raw_parts_mut(ptr, self.block_size) }
    }
}

impl Drop for RingMapping {
    fn drop(&mut self) {
        unsafe {
            if self.ptr != libc::MAP_FAILED && !self.ptr.is_null() {
                let res = libc::munmap(self.ptr, self.len);
                if res < 0 {
                    log::error!("Failed to unmap packet ring: {}", io::Error::last_os_error());
                }
            }
        }
    }
}

fn ring_len(block_size: usize, block_count: usize) -> io::Result<usize> {
    match block_size.checked_mul(block_count) {
        Some(len) if len > 0 && len <= isize::MAX as usize => Ok(len),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("ring of {block_count} blocks of {block_size} bytes cannot be mapped"),
        )),
    }
}
