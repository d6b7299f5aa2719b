//! # Synthetic Ring
//!
//! ## Purpose
//!
//! A ring with the exact memory layout of a TPACKET_V3 `PACKET_RX_RING`, backed by anonymous
//! memory instead of a socket. Tests use it to drive `BlockView`, workers and the dispatcher
//! without `CAP_NET_RAW` or live traffic.
//!
//! ## How it works
//!
//! The producer side plays the kernel. `push_block` packs frame records into the next
//! kernel-owned block the way `packet_rcv` does (48-byte header, `sockaddr_ll`, payload,
//! 16-byte alignment), fills in the block descriptor and only then flips the status word to
//! `TP_STATUS_USER` with release ordering. The consumer side is the same `BlockView` used for
//! real sockets.
//!
//! ## Main components
//!
//! - `SyntheticRing`: the ring, its producer methods and its `BlockSource` impl.
//! - `SyntheticFrame`: one frame to write.
//! - `round_robin()`: spreads frames over several rings like `PACKET_FANOUT_LB`.

use crate::block::BlockView;
use crate::error::PollError;
use crate::mmap::RingMapping;
use crate::ring::{
    BLOCK_HEADER_LEN, BlockDesc, BlockTs, FRAME_HEADER_LEN, TP_STATUS_BLK_TMO, TP_STATUS_USER,
    TP_STATUS_VLAN_VALID, TPACKET3_HDRLEN, Tpacket3Hdr, tpacket_align,
};
use crate::source::BlockSource;
use std::mem::size_of;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::{io, ptr};

/// Offset of the payload from the start of its frame record.
const MAC_OFFSET: usize = tpacket_align(TPACKET3_HDRLEN);
const ETH_HLEN: usize = 14;

/// A frame as the producer side of a `SyntheticRing` writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyntheticFrame {
    pub data: Vec<u8>,
    /// Length on the wire; the captured length when `None`.
    pub wire_len: Option<u32>,
    pub timestamp: Duration,
    pub if_index: i32,
    pub protocol: u16,
    pub vlan_tci: Option<u16>,
    pub rx_hash: u32,
}

impl SyntheticFrame {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        SyntheticFrame {
            data: data.into(),
            if_index: 1,
            protocol: libc::ETH_P_IP as u16,
            ..Default::default()
        }
    }

    pub fn with_wire_len(mut self, wire_len: u32) -> Self {
        self.wire_len = Some(wire_len);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bytes the frame takes in a block, record and padding included.
    pub fn record_len(&self) -> usize {
        tpacket_align(MAC_OFFSET + self.data.len())
    }
}

pub struct SyntheticRing {
    mapping: RingMapping,
    produce: usize,
    consume: usize,
    seq: u64,
}

impl SyntheticRing {
    /// Maps a ring of `block_count` blocks of `block_size` bytes, all kernel-owned.
    pub fn new(block_size: usize, block_count: usize) -> io::Result<Self> {
        if block_size < BLOCK_HEADER_LEN || block_count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no room for a block of {block_size} bytes in {block_count} blocks"),
            ));
        }
        Ok(SyntheticRing {
            mapping: RingMapping::anonymous(block_size, block_count)?,
            produce: 0,
            consume: 0,
            seq: 1,
        })
    }

    pub fn block_size(&self) -> usize {
        self.mapping.block_size()
    }

    pub fn block_count(&self) -> usize {
        self.mapping.block_count()
    }

    pub fn is_user_owned(&self, index: usize) -> bool {
        self.mapping.is_user_owned(index)
    }

    /// Raw bytes of block `index`, for crafting headers the kernel would never write.
    pub fn block_mut(&mut self, index: usize) -> &mut [u8] {
        self.mapping.block_mut(index)
    }

    /// Writes `frames` into the next block and hands it to the consumer side.
    ///
    /// An empty slice produces a block retired by timeout, as the kernel does when no
    /// traffic arrived.
    ///
    /// # Returns
    /// The index of the block written.
    ///
    /// # Errors
    /// Fails if the next block has not been retired yet, or if the frames do not fit.
    pub fn push_block(&mut self, frames: &[SyntheticFrame]) -> io::Result<usize> {
        let index = self.produce;
        if self.mapping.is_user_owned(index) {
            return Err(io::Error::other(format!(
                "block {index} is still owned by the consumer"
            )));
        }
        let first = tpacket_align(BLOCK_HEADER_LEN);
        let used: usize = frames.iter().map(SyntheticFrame::record_len).sum();
        if first + used > self.block_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} frames need {} bytes, block has {}",
                    frames.len(),
                    first + used,
                    self.block_size()
                ),
            ));
        }

        let block = self.mapping.block_mut(index);
        let mut offset = first;
        for (i, frame) in frames.iter().enumerate() {
            let record_len = frame.record_len();
            let last = i + 1 == frames.len();
            write_frame(block, offset, frame, if last { 0 } else { record_len as u32 });
            offset += record_len;
        }

        let ts = |frame: Option<&SyntheticFrame>| {
            frame.map_or(BlockTs::default(), |f| BlockTs {
                ts_sec: f.timestamp.as_secs() as u32,
                ts_nsec: f.timestamp.subsec_nanos(),
            })
        };
        let desc = BlockDesc {
            version: 1,
            offset_to_priv: first as u32,
            block_status: 0,
            num_pkts: frames.len() as u32,
            offset_to_first_pkt: first as u32,
            blk_len: offset as u32,
            seq_num: self.seq,
            ts_first_pkt: ts(frames.first()),
            ts_last_pkt: ts(frames.last()),
        };
        write_struct(block, 0, &desc);

        let status = if frames.is_empty() {
            TP_STATUS_USER | TP_STATUS_BLK_TMO
        } else {
            TP_STATUS_USER
        };
        self.mapping.block_status(index).store(status, Ordering::Release);
        self.seq += 1;
        self.produce = (index + 1) % self.block_count();
        Ok(index)
    }

    /// Pushes `frames` in blocks of at most `frames_per_block`.
    pub fn push_frames(
        &mut self,
        frames: &[SyntheticFrame],
        frames_per_block: usize,
    ) -> io::Result<Vec<usize>> {
        frames
            .chunks(frames_per_block.max(1))
            .map(|chunk| self.push_block(chunk))
            .collect()
    }
}

impl BlockSource for SyntheticRing {
    /// Takes the next block in ring order. When it is not ready this sleeps for `timeout`,
    /// standing in for the `poll` a socket would block in.
    fn next_block(&mut self, timeout: Duration) -> Result<Option<BlockView<'_>>, PollError> {
        let index = self.consume;
        if !self.mapping.is_user_owned(index) {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        self.consume = (index + 1) % self.mapping.block_count();
        Ok(Some(BlockView::new(&mut self.mapping, index)))
    }

    fn block_size(&self) -> usize {
        self.mapping.block_size()
    }
}

/// Deals `frames` to `rings` one at a time, then pushes each ring's share in blocks of
/// `frames_per_block`.
pub fn round_robin(
    frames: &[SyntheticFrame],
    rings: &mut [SyntheticRing],
    frames_per_block: usize,
) -> io::Result<()> {
    if rings.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no rings"));
    }
    let mut shares: Vec<Vec<SyntheticFrame>> = vec![Vec::new(); rings.len()];
    for (i, frame) in frames.iter().enumerate() {
        shares[i % rings.len()].push(frame.clone());
    }
    for (ring, share) in rings.iter_mut().zip(shares) {
        ring.push_frames(&share, frames_per_block)?;
    }
    Ok(())
}

fn write_frame(block: &mut [u8], offset: usize, frame: &SyntheticFrame, next_offset: u32) {
    let snaplen = frame.data.len() as u32;
    let mut status = TP_STATUS_USER;
    if frame.vlan_tci.is_some() {
        status |= TP_STATUS_VLAN_VALID;
    }
    let hdr = Tpacket3Hdr {
        tp_next_offset: next_offset,
        tp_sec: frame.timestamp.as_secs() as u32,
        tp_nsec: frame.timestamp.subsec_nanos(),
        tp_snaplen: snaplen,
        tp_len: frame.wire_len.unwrap_or(snaplen),
        tp_status: status,
        tp_mac: MAC_OFFSET as u16,
        tp_net: (MAC_OFFSET + ETH_HLEN) as u16,
        tp_rxhash: frame.rx_hash,
        tp_vlan_tci: frame.vlan_tci.unwrap_or(0) as u32,
        tp_vlan_tpid: if frame.vlan_tci.is_some() { 0x8100 } else { 0 },
        ..Default::default()
    };
    write_struct(block, offset, &hdr);

    let mut ll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    ll.sll_family = libc::AF_PACKET as u16;
    ll.sll_protocol = frame.protocol.to_be();
    ll.sll_ifindex = frame.if_index;
    ll.sll_pkttype = libc::PACKET_HOST as u8;
    ll.sll_halen = 6;
    write_struct(block, offset + FRAME_HEADER_LEN, &ll);

    let start = offset + MAC_OFFSET;
    block[start..start + frame.data.len()].copy_from_slice(&frame.data);
}

/// Copies `value` into `buf` at `offset`.
///
/// # Panics
///
/// Panics if the value does not fit.
pub(crate) fn write_struct<T: Copy>(buf: &mut [u8], offset: usize, value: &T) {
    assert!(
        offset + size_of::<T>() <= buf.len(),
        "{} bytes at offset {offset} overrun a buffer of {}",
        size_of::<T>(),
        buf.len()
    );
    unsafe { ptr::write_unaligned(buf.as_mut_ptr().add(offset) as *mut T, *value) }
}
