use crate::block::BlockView;
use crate::error::PollError;
use crate::socket::SocketStats;
use std::time::Duration;

/// A ring a worker can take blocks from.
///
/// Implemented by `CaptureSocket` for real capture and by `SyntheticRing` for tests. Both
/// hand out blocks in ring order and expect each one to be retired before the next is taken,
/// which the borrow in `BlockView` enforces.
pub trait BlockSource: Send {
    /// Waits up to `timeout` for the next block. `Ok(None)` means none became ready.
    fn next_block(&mut self, timeout: Duration) -> Result<Option<BlockView<'_>>, PollError>;

    /// Bytes per block, used to track the stream offset of each block.
    fn block_size(&self) -> usize;

    /// Kernel drop counters, where the source has any.
    fn statistics(&self) -> Option<SocketStats> {
        None
    }
}
