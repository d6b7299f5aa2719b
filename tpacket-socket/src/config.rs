//! # Capture Configuration
//!
//! ## Purpose
//!
//! Holds the immutable values a capture run is built from: the geometry of each socket's
//! ring (`RingConfig`), the fan-out policy shared by the sockets, and the process-level
//! settings (`CaptureConfig`) the dispatcher hands to every worker.
//!
//! ## How it works
//!
//! Every check runs here, before a socket is opened, so an invalid configuration is
//! rejected without touching the OS. `CaptureConfig` is constructed once, validated, and
//! then only read; workers receive the pieces they need by value.

use crate::error::ConfigError;
use crate::mmap::page_size;
use crate::ring::{
    PACKET_FANOUT_CPU, PACKET_FANOUT_FLAG_DEFRAG, PACKET_FANOUT_FLAG_ROLLOVER, PACKET_FANOUT_HASH,
    PACKET_FANOUT_LB, PACKET_FANOUT_QM, PACKET_FANOUT_RND, PACKET_FANOUT_ROLLOVER,
    TP_FT_REQ_FILL_RXHASH, TPACKET_ALIGNMENT, TPACKET3_HDRLEN, TpacketReq3,
};
use crate::worker::WorkerOptions;
use std::time::Duration;

/// Fewest blocks a ring may be registered with.
pub const MIN_BLOCK_COUNT: u32 = 16;
/// Smallest block size accepted on the capture configuration surface, in KiB.
pub const MIN_BLOCK_SIZE_KB: u64 = 10;

/// Link-layer handling of the packet socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketKind {
    /// `SOCK_RAW`: frames include the link-layer header.
    #[default]
    Raw,
    /// `SOCK_DGRAM`: the kernel strips the link-layer header.
    Datagram,
}

impl SocketKind {
    pub(crate) fn as_raw(self) -> libc::c_int {
        match self {
            SocketKind::Raw => libc::SOCK_RAW,
            SocketKind::Datagram => libc::SOCK_DGRAM,
        }
    }
}

/// Geometry and timing of one `PACKET_RX_RING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Bytes per block; a multiple of the page size.
    pub block_size: u32,
    /// Number of blocks in the ring.
    pub block_count: u32,
    /// Milliseconds after which the kernel hands over a partially filled block.
    pub retire_timeout_ms: u32,
    /// Frame slot size hint. The kernel packs TPACKET_V3 frames back to back regardless,
    /// so this only has to be consistent; `None` uses the block size.
    pub frame_size: Option<u32>,
    /// Ask the kernel to fill `tp_rxhash` in every frame record.
    pub fill_rxhash: bool,
}

impl RingConfig {
    pub fn new(block_size: u32, block_count: u32, retire_timeout_ms: u32) -> Self {
        RingConfig {
            block_size,
            block_count,
            retire_timeout_ms,
            frame_size: None,
            fill_rxhash: false,
        }
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size.unwrap_or(self.block_size)
    }

    /// Total bytes of the mapped ring.
    pub fn ring_len(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }

    /// Checks the ring against the rules the kernel enforces on `PACKET_RX_RING`.
    ///
    /// # Arguments
    /// * `page_size` - The system page size, see `mmap::page_size()`.
    pub fn validate(&self, page_size: usize) -> Result<(), ConfigError> {
        let block_size = self.block_size as u64;
        let page = page_size as u64;
        if block_size < page {
            return Err(ConfigError::BlockSizeTooSmall {
                size: block_size,
                min: page,
            });
        }
        if block_size % page != 0 {
            return Err(ConfigError::BlockSizeNotPageAligned {
                size: block_size,
                page,
            });
        }
        if self.block_count < MIN_BLOCK_COUNT {
            return Err(ConfigError::TooFewBlocks {
                count: self.block_count as u64,
                min: MIN_BLOCK_COUNT as u64,
            });
        }
        if self.retire_timeout_ms == 0 {
            return Err(ConfigError::ZeroRetireTimeout);
        }

        let frame_size = self.frame_size() as u64;
        if frame_size < TPACKET3_HDRLEN as u64
            || frame_size % TPACKET_ALIGNMENT as u64 != 0
            || frame_size > block_size
        {
            return Err(ConfigError::InvalidFrameSize {
                frame_size,
                block_size,
            });
        }

        let too_large = ConfigError::RingTooLarge {
            block_size,
            block_count: self.block_count as u64,
        };
        let total = block_size
            .checked_mul(self.block_count as u64)
            .ok_or_else(|| too_large.clone())?;
        if total > isize::MAX as u64 || usize::try_from(total).is_err() {
            return Err(too_large);
        }
        let frame_nr = (block_size / frame_size) * self.block_count as u64;
        if frame_nr > u32::MAX as u64 {
            return Err(too_large);
        }
        Ok(())
    }

    /// Builds the `tpacket_req3` registered with `PACKET_RX_RING`.
    pub(crate) fn to_request(&self) -> TpacketReq3 {
        let frame_size = self.frame_size();
        TpacketReq3 {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count,
            tp_frame_size: frame_size,
            tp_frame_nr: (self.block_size / frame_size) * self.block_count,
            tp_retire_blk_tov: self.retire_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: if self.fill_rxhash {
                TP_FT_REQ_FILL_RXHASH
            } else {
                0
            },
        }
    }
}

/// How the kernel picks a group member for each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutMode {
    /// By flow hash, keeping each flow on one socket.
    Hash,
    /// Round-robin.
    #[default]
    LoadBalance,
    /// By the CPU the packet arrived on.
    Cpu,
    /// Fill one socket, then move on to the next.
    Rollover,
    Random,
    /// By the NIC receive queue.
    QueueMapping,
}

/// Fan-out policy: a mode plus the optional flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub mode: FanoutMode,
    /// Move packets to another member when the chosen one is backlogged.
    pub rollover: bool,
    /// Defragment IP packets before choosing a member.
    pub defrag: bool,
}

impl Default for Fanout {
    fn default() -> Self {
        Fanout {
            mode: FanoutMode::LoadBalance,
            rollover: true,
            defrag: false,
        }
    }
}

impl Fanout {
    /// Encodes the `PACKET_FANOUT` option value: group id in the low 16 bits, mode and
    /// flags in the high 16 bits.
    pub(crate) fn socket_arg(&self, group_id: u16) -> u32 {
        let mut kind = match self.mode {
            FanoutMode::Hash => PACKET_FANOUT_HASH,
            FanoutMode::LoadBalance => PACKET_FANOUT_LB,
            FanoutMode::Cpu => PACKET_FANOUT_CPU,
            FanoutMode::Rollover => PACKET_FANOUT_ROLLOVER,
            FanoutMode::Random => PACKET_FANOUT_RND,
            FanoutMode::QueueMapping => PACKET_FANOUT_QM,
        };
        if self.rollover {
            kind |= PACKET_FANOUT_FLAG_ROLLOVER;
        }
        if self.defrag {
            kind |= PACKET_FANOUT_FLAG_DEFRAG;
        }
        group_id as u32 | (kind << 16)
    }
}

/// Checks a name the way the kernel's `dev_valid_name` does.
pub fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.len() >= libc::IFNAMSIZ {
        Some("longer than 15 bytes")
    } else if name == "." || name == ".." {
        Some("reserved name")
    } else if name.contains('\0') {
        Some("contains a NUL byte")
    } else if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        Some("contains '/', ':' or whitespace")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Settings of a whole capture run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Interface to capture on.
    pub interface: String,
    /// Worker threads, one socket each.
    pub threads: usize,
    pub block_size_kb: u64,
    pub block_count: u32,
    /// A partially filled block is handed over after this long.
    pub block_timeout: Duration,
    pub fanout: Fanout,
    /// Fan-out group id; 0 derives one from the process id.
    pub fanout_id: u16,
    pub promiscuous: bool,
    /// Stop after this many frames per worker.
    pub frame_budget: Option<u64>,
    /// Upper bound on one readiness wait; also bounds shutdown latency.
    pub poll_timeout: Duration,
    /// Pin worker `i` to CPU `i` when more than one worker runs.
    pub pin_cpus: bool,
    pub socket_kind: SocketKind,
}

impl CaptureConfig {
    /// Creates a configuration for `interface` with the defaults of the capture tool.
    pub fn new(interface: impl Into<String>) -> Self {
        CaptureConfig {
            interface: interface.into(),
            threads: 1,
            block_size_kb: 1024,
            block_count: 2048,
            block_timeout: Duration::from_secs(10),
            fanout: Fanout::default(),
            fanout_id: 0,
            promiscuous: true,
            frame_budget: None,
            poll_timeout: Duration::from_secs(1),
            pin_cpus: true,
            socket_kind: SocketKind::Raw,
        }
    }

    /// Validates every field against the current page size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with_page_size(page_size())
    }

    pub fn validate_with_page_size(&self, page_size: usize) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.poll_timeout < Duration::from_millis(1) {
            return Err(ConfigError::ZeroPollTimeout);
        }
        if self.block_size_kb < MIN_BLOCK_SIZE_KB {
            return Err(ConfigError::BlockSizeTooSmall {
                size: self.block_size_kb.saturating_mul(1024),
                min: MIN_BLOCK_SIZE_KB * 1024,
            });
        }
        validate_interface_name(&self.interface)?;
        self.ring_config()?.validate(page_size)
    }

    /// Derives the per-socket ring from the run settings.
    ///
    /// The kernel is asked to retire a block one millisecond before the configured
    /// timeout, so a block that times out is already waiting when a poll of the same
    /// length returns.
    pub fn ring_config(&self) -> Result<RingConfig, ConfigError> {
        let block_size = self
            .block_size_kb
            .checked_mul(1024)
            .and_then(|size| u32::try_from(size).ok())
            .ok_or(ConfigError::RingTooLarge {
                block_size: self.block_size_kb.saturating_mul(1024),
                block_count: self.block_count as u64,
            })?;
        let millis = self.block_timeout.as_millis();
        if millis == 0 {
            return Err(ConfigError::ZeroRetireTimeout);
        }
        let retire_timeout_ms = u32::try_from(millis - 1)
            .map_err(|_| ConfigError::RetireTimeoutTooLarge { millis })?
            .max(1);
        Ok(RingConfig {
            block_size,
            block_count: self.block_count,
            retire_timeout_ms,
            frame_size: Some(block_size),
            fill_rxhash: false,
        })
    }

    /// Returns the fan-out group the sockets join, if any.
    ///
    /// A single worker without an explicit id captures alone. Otherwise the explicit id
    /// is used, or one derived from the process id so separate runs do not share a group.
    pub fn fanout_group(&self) -> Option<u16> {
        if self.fanout_id > 0 {
            Some(self.fanout_id)
        } else if self.threads > 1 {
            Some(std::process::id() as u16)
        } else {
            None
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            poll_timeout: self.poll_timeout,
            frame_budget: self.frame_budget,
            pin_cpu: self.pin_cpus && self.threads > 1,
        }
    }
}
