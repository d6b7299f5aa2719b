mod dispatch;
mod worker;

use crate::frame::FrameView;
use crate::synthetic::SyntheticFrame;
use std::time::Duration;

pub(crate) const BLOCK_SIZE: usize = 4096;

/// Frames whose payload is `tag` followed by filler up to `len` bytes.
pub(crate) fn tagged(tag: u32, len: usize) -> SyntheticFrame {
    let mut data = tag.to_be_bytes().to_vec();
    data.resize(len.max(4), 0xab);
    SyntheticFrame::new(data).with_timestamp(Duration::new(1_700_000_000 + tag as u64, tag * 1000))
}

pub(crate) fn tag_of(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
}

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fixes a closure's signature to the one `FrameConsumer` is implemented for.
pub(crate) fn consumer<F>(f: F) -> F
where
    F: FnMut(&FrameView<'_>, u64) + Send,
{
    f
}
