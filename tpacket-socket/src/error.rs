//! Error types for ring setup, block acquisition and block decoding.

use std::fmt;
use std::io;

/// Invalid ring, thread or interface parameters. Always detected before any OS resource
/// is acquired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("block size {size} is below the minimum of {min} bytes")]
    BlockSizeTooSmall { size: u64, min: u64 },

    #[error("block size {size} is not a multiple of the page size {page}")]
    BlockSizeNotPageAligned { size: u64, page: u64 },

    #[error("block count {count} is below the minimum of {min}")]
    TooFewBlocks { count: u64, min: u64 },

    #[error("ring of {block_count} blocks of {block_size} bytes exceeds what the kernel can map")]
    RingTooLarge { block_size: u64, block_count: u64 },

    #[error("frame size {frame_size} is invalid for block size {block_size}")]
    InvalidFrameSize { frame_size: u64, block_size: u64 },

    #[error("block retire timeout must be at least one millisecond")]
    ZeroRetireTimeout,

    #[error("retire timeout of {millis} ms does not fit the kernel request")]
    RetireTimeoutTooLarge { millis: u128 },

    #[error("thread count must be at least 1")]
    ZeroThreads,

    #[error("poll timeout must be at least one millisecond")]
    ZeroPollTimeout,

    #[error("invalid interface name {name:?}: {reason}")]
    InvalidInterfaceName { name: String, reason: &'static str },
}

/// The setup step a `BindError::Os` failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStep {
    ResolveInterface,
    OpenSocket,
    SetVersion,
    RegisterRing,
    MapRing,
    Bind,
    Promiscuous,
    JoinFanout,
}

impl fmt::Display for BindStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BindStep::ResolveInterface => "resolving interface",
            BindStep::OpenSocket => "opening packet socket",
            BindStep::SetVersion => "selecting TPACKET_V3",
            BindStep::RegisterRing => "registering RX ring",
            BindStep::MapRing => "mapping RX ring",
            BindStep::Bind => "binding to interface",
            BindStep::Promiscuous => "enabling promiscuous mode",
            BindStep::JoinFanout => "joining fan-out group",
        })
    }
}

/// Failure while turning a builder into a bound `CaptureSocket`.
///
/// Whatever was acquired before the failing step has been released by the time this is
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("CAP_NET_RAW is required to capture on {interface}")]
    MissingCapability { interface: String },

    #[error("{step} on {interface} failed: {source}")]
    Os {
        step: BindStep,
        interface: String,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub(crate) fn os(step: BindStep, interface: &str, source: io::Error) -> Self {
        BindError::Os {
            step,
            interface: interface.to_string(),
            source,
        }
    }

    /// Returns the step that failed, if the failure came from the OS.
    pub fn step(&self) -> Option<BindStep> {
        match self {
            BindError::Os { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Failure of the readiness wait itself. A timeout is not an error.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("waiting for a ready block failed: {0}")]
    Wait(#[source] io::Error),

    #[error("socket is closed")]
    Closed,
}

/// The way a kernel-written block header contradicted the bytes actually available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// `offset_to_first_pkt` points into the block descriptor.
    FirstFrameInHeader,
    /// A frame record does not fit below the block length.
    HeaderOutOfBounds,
    /// A frame's payload runs past the block length.
    PayloadOutOfBounds,
    /// A frame's payload starts inside its own record.
    PayloadInHeader,
    /// A frame before the declared last one has `tp_next_offset == 0`.
    ZeroStride,
    /// `tp_snaplen` exceeds `tp_len`.
    CaptureExceedsWire,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViolationKind::FirstFrameInHeader => "first frame offset inside block header",
            ViolationKind::HeaderOutOfBounds => "frame header past end of block",
            ViolationKind::PayloadOutOfBounds => "frame payload past end of block",
            ViolationKind::PayloadInHeader => "frame payload overlaps its header",
            ViolationKind::ZeroStride => "zero offset to next frame",
            ViolationKind::CaptureExceedsWire => "captured length exceeds wire length",
        })
    }
}

/// A block header that is internally inconsistent. Recorded once per block; iteration
/// stops at the offending frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("block {block}: {kind} at frame {frame} of {declared} (offset {offset})")]
pub struct ProtocolViolation {
    pub block: usize,
    pub frame: u32,
    pub declared: u32,
    pub offset: usize,
    pub kind: ViolationKind,
}

/// Startup failure of the dispatcher. No worker is left running when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("socket setup failed: {0}")]
    Bind(#[from] BindError),

    #[error("failed to spawn worker {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: io::Error,
    },
}
