//! # TPACKET_V3 Ring Layout
//!
//! ## Purpose
//!
//! Mirrors the binary layout the kernel writes into a `PACKET_RX_RING` when the socket
//! runs `TPACKET_V3`: the block descriptor at the start of every block, the per-frame
//! `tpacket3_hdr` records packed behind it, and the request/statistics structures passed
//! through `setsockopt`/`getsockopt`.
//!
//! ## How it works
//!
//! The structs are `#[repr(C)]` copies of the uapi definitions in `linux/if_packet.h`.
//! They are never used to reinterpret the mapping in place: readers copy a header out with
//! `ptr::read_unaligned` after checking that it lies inside the block, so a corrupt block
//! can never cause an out-of-bounds access. Sizes and offsets are pinned with
//! `static_assertions` so a layout slip fails the build instead of a capture.

use static_assertions::{assert_eq_size, const_assert, const_assert_eq};
use std::mem::{offset_of, size_of};

pub const PACKET_RX_RING: libc::c_int = 5;
pub const PACKET_STATISTICS: libc::c_int = 6;
pub const PACKET_VERSION: libc::c_int = 10;
pub const PACKET_FANOUT: libc::c_int = 18;
pub const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
pub const PACKET_MR_PROMISC: u16 = 1;

pub const TPACKET_V3: libc::c_int = 2;

pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1;
pub const TP_STATUS_LOSING: u32 = 1 << 2;
pub const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
pub const TP_STATUS_BLK_TMO: u32 = 1 << 5;

pub const TP_FT_REQ_FILL_RXHASH: u32 = 1;

pub const PACKET_FANOUT_HASH: u32 = 0;
pub const PACKET_FANOUT_LB: u32 = 1;
pub const PACKET_FANOUT_CPU: u32 = 2;
pub const PACKET_FANOUT_ROLLOVER: u32 = 3;
pub const PACKET_FANOUT_RND: u32 = 4;
pub const PACKET_FANOUT_QM: u32 = 5;
pub const PACKET_FANOUT_FLAG_ROLLOVER: u32 = 0x1000;
pub const PACKET_FANOUT_FLAG_DEFRAG: u32 = 0x8000;

/// Frame records inside a block start on this boundary.
pub const TPACKET_ALIGNMENT: usize = 16;

pub const fn tpacket_align(len: usize) -> usize {
    (len + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Size of the descriptor at the head of every block.
pub const BLOCK_HEADER_LEN: usize = size_of::<BlockDesc>();
/// Aligned size of a frame record, i.e. where its `sockaddr_ll` starts.
pub const FRAME_HEADER_LEN: usize = tpacket_align(size_of::<Tpacket3Hdr>());
/// Frame record plus the link-layer address the kernel stores behind it.
pub const TPACKET3_HDRLEN: usize = FRAME_HEADER_LEN + size_of::<libc::sockaddr_ll>();

/// `struct tpacket_req3`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpacketReq3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

/// `struct packet_mreq`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMreq {
    pub mr_ifindex: i32,
    pub mr_type: u16,
    pub mr_alen: u16,
    pub mr_address: [u8; 8],
}

/// `struct tpacket_stats_v3`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketStatsV3 {
    pub tp_packets: u32,
    pub tp_drops: u32,
    pub tp_freeze_q_cnt: u32,
}

/// `struct tpacket_bd_ts`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockTs {
    pub ts_sec: u32,
    pub ts_nsec: u32,
}

/// `struct tpacket_block_desc` with the `tpacket_hdr_v1` union member flattened in.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockDesc {
    pub version: u32,
    pub offset_to_priv: u32,
    pub block_status: u32,
    pub num_pkts: u32,
    pub offset_to_first_pkt: u32,
    pub blk_len: u32,
    pub seq_num: u64,
    pub ts_first_pkt: BlockTs,
    pub ts_last_pkt: BlockTs,
}

/// `struct tpacket3_hdr` with `tpacket_hdr_variant1` flattened in.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Tpacket3Hdr {
    pub tp_next_offset: u32,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_snaplen: u32,
    pub tp_len: u32,
    pub tp_status: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_rxhash: u32,
    pub tp_vlan_tci: u32,
    pub tp_vlan_tpid: u16,
    pub _padding: u16,
    pub _tp_padding: [u8; 8],
}

/// Offset of the status word the kernel and userspace hand the block back and forth with.
pub const BLOCK_STATUS_OFFSET: usize = offset_of!(BlockDesc, block_status);

assert_eq_size!(TpacketReq3, [u32; 7]);
assert_eq_size!(TpacketStatsV3, [u32; 3]);
const_assert_eq!(size_of::<PacketMreq>(), 16);
const_assert_eq!(size_of::<BlockDesc>(), 48);
const_assert_eq!(size_of::<Tpacket3Hdr>(), 48);
const_assert_eq!(size_of::<libc::sockaddr_ll>(), 20);
const_assert_eq!(BLOCK_STATUS_OFFSET, 8);
const_assert_eq!(offset_of!(BlockDesc, seq_num), 24);
const_assert_eq!(offset_of!(BlockDesc, ts_last_pkt), 40);
const_assert_eq!(offset_of!(Tpacket3Hdr, tp_mac), 24);
const_assert_eq!(offset_of!(Tpacket3Hdr, tp_vlan_tci), 32);
const_assert!(BLOCK_STATUS_OFFSET % align_of::<u32>() == 0);
