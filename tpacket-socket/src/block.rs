//! # Walking a Ring Block
//!
//! ## Purpose
//!
//! A `BlockView` is what `next_block` hands out: a cursor over one block the kernel has
//! passed to userspace. It yields the block's frames in arrival order without copying, and
//! hands the block back to the kernel when it is retired.
//!
//! ## How it works
//!
//! The block descriptor is copied out of the ring once, when the view is created. Frames are
//! then decoded lazily: the first sits at `offset_to_first_pkt`, every later one at the
//! previous frame plus its `tp_next_offset`. Each record is bounds-checked against the
//! smaller of `blk_len` and the block size before it is read, and its payload is checked
//! before a slice is formed over it. The first inconsistency ends iteration and is kept as a
//! `ProtocolViolation`; the block is still retired normally.
//!
//! Retiring writes `TP_STATUS_KERNEL` to the status word with release ordering. `retire`
//! takes the view by value, and frames borrow the view, so a frame can never be read after
//! its block went back to the kernel.
//!
//! ## Main components
//!
//! - `BlockView`: cursor, accessors for the block descriptor, `retire`.

use crate::error::{ProtocolViolation, ViolationKind};
use crate::frame::FrameView;
use crate::mmap::RingMapping;
use crate::ring::{
    BLOCK_HEADER_LEN, BlockDesc, FRAME_HEADER_LEN, TP_STATUS_BLK_TMO, TP_STATUS_KERNEL,
    TPACKET3_HDRLEN, Tpacket3Hdr,
};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use std::{ptr, slice};

pub struct BlockView<'a> {
    base: *const u8,
    index: usize,
    status: &'a AtomicU32,
    desc: BlockDesc,
    limit: usize,
    consumed: u32,
    offset: usize,
    next_offset: u32,
    violation: Option<ProtocolViolation>,
    retired: bool,
    _ring: PhantomData<&'a mut RingMapping>,
}

impl<'a> BlockView<'a> {
    /// Creates a view over block `index`, which the caller has seen as user-owned.
    pub(crate) fn new(ring: &'a mut RingMapping, index: usize) -> Self {
        let ring: &'a RingMapping = ring;
        let base = ring.block_ptr(index) as *const u8;
        // The kernel does not touch a user-owned block, so one copy of the
        // descriptor is all the header reading this view does.
        let desc = unsafe { ptr::read_volatile(base as *const BlockDesc) };
        let limit = (desc.blk_len as usize).min(ring.block_size());
        BlockView {
            base,
            index,
            status: ring.block_status(index),
            desc,
            limit,
            consumed: 0,
            offset: 0,
            next_offset: 0,
            violation: None,
            retired: false,
            _ring: PhantomData,
        }
    }

    /// Position of the block in the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Sequence number the kernel assigned to the block.
    pub fn sequence(&self) -> u64 {
        self.desc.seq_num
    }

    /// Number of frames the header declares.
    pub fn frame_count(&self) -> u32 {
        self.desc.num_pkts
    }

    /// Bytes of the block the kernel reports as used, header included.
    pub fn block_len(&self) -> u32 {
        self.desc.blk_len
    }

    pub fn first_timestamp(&self) -> Duration {
        Duration::new(self.desc.ts_first_pkt.ts_sec as u64, 0)
            + Duration::from_nanos(self.desc.ts_first_pkt.ts_nsec as u64)
    }

    pub fn last_timestamp(&self) -> Duration {
        Duration::new(self.desc.ts_last_pkt.ts_sec as u64, 0)
            + Duration::from_nanos(self.desc.ts_last_pkt.ts_nsec as u64)
    }

    /// The block was handed over because the retire timeout expired, not because it filled.
    pub fn timed_out(&self) -> bool {
        self.desc.block_status & TP_STATUS_BLK_TMO != 0
    }

    /// The kernel produced no frames in this block.
    pub fn is_empty(&self) -> bool {
        self.desc.num_pkts == 0
    }

    /// Frames yielded so far.
    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    /// No further frames will be yielded.
    pub fn is_exhausted(&self) -> bool {
        self.violation.is_some() || self.consumed >= self.desc.num_pkts
    }

    /// The inconsistency that cut iteration short, if any.
    pub fn violation(&self) -> Option<&ProtocolViolation> {
        self.violation.as_ref()
    }

    /// Advances to the next frame in the block.
    ///
    /// Returns `None` once the declared frame count is reached or a header turned out to
    /// be inconsistent with the bytes available.
    pub fn next_frame(&mut self) -> Option<FrameView<'_>> {
        if self.retired || self.is_exhausted() {
            return None;
        }
        let offset = if self.consumed == 0 {
            let first = self.desc.offset_to_first_pkt as usize;
            if first < BLOCK_HEADER_LEN {
                return self.flag(ViolationKind::FirstFrameInHeader, first);
            }
            first
        } else {
            if self.next_offset == 0 {
                return self.flag(ViolationKind::ZeroStride, self.offset);
            }
            match self.offset.checked_add(self.next_offset as usize) {
                Some(next) => next,
                None => return self.flag(ViolationKind::HeaderOutOfBounds, self.offset),
            }
        };

        let hdr = match self.decode(offset) {
            Ok(hdr) => hdr,
            Err(kind) => return self.flag(kind, offset),
        };
        let ll = unsafe {
            ptr::read_unaligned(self.base.add(offset + FRAME_HEADER_LEN) as *const libc::sockaddr_ll)
        };
        let data = unsafe {
            slice::from_raw_parts(
                self.base.add(offset + hdr.tp_mac as usize),
                hdr.tp_snaplen as usize,
            )
        };

        self.consumed += 1;
        self.offset = offset;
        self.next_offset = hdr.tp_next_offset;
        Some(FrameView {
            data,
            hdr,
            if_index: ll.sll_ifindex,
            protocol: u16::from_be(ll.sll_protocol),
            packet_type: ll.sll_pkttype,
            offset,
        })
    }

    /// Reads the frame record at `offset` once it and its payload are known to fit.
    fn decode(&self, offset: usize) -> Result<Tpacket3Hdr, ViolationKind> {
        match offset.checked_add(TPACKET3_HDRLEN) {
            Some(end) if end <= self.limit => {}
            _ => return Err(ViolationKind::HeaderOutOfBounds),
        }
        let hdr = unsafe { ptr::read_unaligned(self.base.add(offset) as *const Tpacket3Hdr) };
        if (hdr.tp_mac as usize) < TPACKET3_HDRLEN {
            return Err(ViolationKind::PayloadInHeader);
        }
        let start = offset + hdr.tp_mac as usize;
        match start.checked_add(hdr.tp_snaplen as usize) {
            Some(end) if end <= self.limit => {}
            _ => return Err(ViolationKind::PayloadOutOfBounds),
        }
        if hdr.tp_snaplen > hdr.tp_len {
            return Err(ViolationKind::CaptureExceedsWire);
        }
        Ok(hdr)
    }

    fn flag<T>(&mut self, kind: ViolationKind, offset: usize) -> Option<T> {
        let violation = ProtocolViolation {
            block: self.index,
            frame: self.consumed,
            declared: self.desc.num_pkts,
            offset,
            kind,
        };
        log::warn!("Corrupt ring block, truncating iteration: {violation}");
        self.violation = Some(violation);
        None
    }

    /// Returns the block to the kernel.
    ///
    /// # Panics
    ///
    /// Panics if frames remain unread: retiring early would silently drop them, which is
    /// a bug in the caller rather than a condition to recover from.
    pub fn retire(mut self) {
        assert!(
            self.is_exhausted(),
            "block {} retired after {} of {} frames",
            self.index,
            self.consumed,
            self.desc.num_pkts
        );
        self.release();
    }

    fn release(&mut self) {
        if !self.retired {
            self.status.store(TP_STATUS_KERNEL, Ordering::Release);
            self.retired = true;
        }
    }
}

impl Drop for BlockView<'_> {
    fn drop(&mut self) {
        if !self.retired {
            log::warn!(
                "Block {} dropped without being retired, returning it to the kernel",
                self.index
            );
            self.release();
        }
    }
}
