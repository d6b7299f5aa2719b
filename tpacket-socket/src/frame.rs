use crate::ring::{TP_STATUS_LOSING, TP_STATUS_VLAN_VALID, Tpacket3Hdr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One captured frame, read in place from a user-owned block.
///
/// The payload is a window into the ring; it is only valid until the owning block is
/// retired, which the borrow on the `BlockView` enforces. Use `to_vec` to keep the bytes
/// longer.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub(crate) data: &'a [u8],
    pub(crate) hdr: Tpacket3Hdr,
    pub(crate) if_index: i32,
    pub(crate) protocol: u16,
    pub(crate) packet_type: u8,
    pub(crate) offset: usize,
}

impl<'a> FrameView<'a> {
    /// The captured bytes, starting at the link-layer header for `SOCK_RAW` sockets.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn captured_len(&self) -> u32 {
        self.hdr.tp_snaplen
    }

    /// Length of the frame on the wire.
    #[inline]
    pub fn original_len(&self) -> u32 {
        self.hdr.tp_len
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.hdr.tp_snaplen < self.hdr.tp_len
    }

    /// Capture time as a duration since the Unix epoch.
    pub fn timestamp(&self) -> Duration {
        Duration::new(self.hdr.tp_sec as u64, 0) + Duration::from_nanos(self.hdr.tp_nsec as u64)
    }

    pub fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.timestamp()
    }

    /// Index of the interface the frame arrived on.
    pub fn if_index(&self) -> i32 {
        self.if_index
    }

    /// EtherType from the link-layer address, in host byte order.
    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    /// `PACKET_HOST`, `PACKET_BROADCAST`, `PACKET_OUTGOING`, ...
    pub fn packet_type(&self) -> u8 {
        self.packet_type
    }

    /// The VLAN tag the NIC stripped, if any.
    pub fn vlan_tci(&self) -> Option<u16> {
        (self.hdr.tp_status & TP_STATUS_VLAN_VALID != 0).then_some(self.hdr.tp_vlan_tci as u16)
    }

    /// Flow hash, filled only when the ring was registered with `fill_rxhash`.
    pub fn rx_hash(&self) -> u32 {
        self.hdr.tp_rxhash
    }

    /// The kernel dropped frames on this socket before this one was written.
    pub fn is_losing(&self) -> bool {
        self.hdr.tp_status & TP_STATUS_LOSING != 0
    }

    /// Offset of the frame record from the start of its block.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Copies the payload out of the ring.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}
