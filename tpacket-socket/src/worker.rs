//! # Capture Worker
//!
//! ## Purpose
//!
//! A worker is one thread draining one ring. It takes blocks in ring order, passes every
//! frame to its consumer, and retires each block before asking for the next.
//!
//! ## How it works
//!
//! The worker moves through `Starting -> Running -> Draining -> Stopped`:
//!
//! - `Starting` pins the thread to a CPU when asked to. A failure only costs locality, so it
//!   is logged and ignored.
//! - `Running` loops on `next_block`. A timeout is counted and the shutdown token checked.
//!   A block is walked to the end and retired, whatever happens to the token meanwhile.
//! - `Draining` is entered when the frame budget runs out. The rest of the current block is
//!   walked without reaching the consumer, the block is retired and the loop ends.
//! - `Stopped` reads the socket's kernel counters and returns the report.
//!
//! A `PollError` stops this worker only; its siblings keep running.
//!
//! ## Main components
//!
//! - `Worker`: the state machine, generic over its `BlockSource` and `FrameConsumer`.
//! - `FrameConsumer`: downstream sink for frames, implemented for closures.
//! - `WorkerStats`, `WorkerReport`: what a stopped worker hands back.

use crate::affinity::{cpu_for_worker, pin_current_thread};
use crate::block::BlockView;
use crate::error::PollError;
use crate::frame::FrameView;
use crate::source::BlockSource;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Receives every frame a worker reads.
///
/// The view is only valid for the duration of the call; copy what has to outlive it.
pub trait FrameConsumer: Send {
    /// `block_offset` is the byte offset of the frame's block in the worker's capture
    /// stream, i.e. blocks processed before it times the block size.
    fn consume(&mut self, frame: &FrameView<'_>, block_offset: u64);
}

impl<F> FrameConsumer for F
where
    F: FnMut(&FrameView<'_>, u64) + Send,
{
    fn consume(&mut self, frame: &FrameView<'_>, block_offset: u64) {
        self(frame, block_offset)
    }
}

/// Discards every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConsumer;

impl FrameConsumer for NullConsumer {
    fn consume(&mut self, _frame: &FrameView<'_>, _block_offset: u64) {}
}

/// Per-worker settings derived from the capture configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Longest single wait for a block; bounds how late a stop request is noticed.
    pub poll_timeout: Duration,
    /// Frames to forward before the worker stops on its own.
    pub frame_budget: Option<u64>,
    pub pin_cpu: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            poll_timeout: Duration::from_secs(1),
            frame_budget: None,
            pin_cpu: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Counters kept by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub blocks: u64,
    /// Blocks handed over without any frame, normally by the retire timeout.
    pub empty_blocks: u64,
    /// Waits that ended without a block.
    pub timeouts: u64,
    /// Frames passed to the consumer.
    pub frames: u64,
    /// Captured bytes passed to the consumer.
    pub bytes: u64,
    /// Forwarded frames shorter than on the wire.
    pub truncated: u64,
    /// Frames walked while draining and not forwarded.
    pub skipped: u64,
    /// Blocks whose iteration was cut short by an inconsistent header.
    pub violations: u64,
    pub remaining_budget: Option<u64>,
    /// CPU the thread was pinned to, if pinning was asked for and succeeded.
    pub pinned_cpu: Option<usize>,
    /// Kernel counters read when the worker stopped, if the source has them.
    pub kernel_packets: u64,
    pub kernel_drops: u64,
}

/// Why a worker stopped.
#[derive(Debug)]
pub enum WorkerExit {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The frame budget ran out.
    BudgetExhausted,
    /// Waiting for a block failed.
    Failed(PollError),
    /// The worker thread panicked; its counters are lost.
    Panicked(String),
}

#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    pub stats: WorkerStats,
    pub exit: WorkerExit,
}

impl WorkerReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.exit, WorkerExit::Failed(_) | WorkerExit::Panicked(_))
    }
}

pub struct Worker<S, C> {
    id: usize,
    source: S,
    consumer: C,
    options: WorkerOptions,
    cpu: usize,
    state: WorkerState,
    stats: WorkerStats,
    shutdown: CancellationToken,
}

impl<S: BlockSource, C: FrameConsumer> Worker<S, C> {
    pub fn new(
        id: usize,
        source: S,
        consumer: C,
        options: WorkerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Worker {
            id,
            source,
            consumer,
            options,
            cpu: cpu_for_worker(id),
            state: WorkerState::Starting,
            stats: WorkerStats {
                remaining_budget: options.frame_budget,
                ..Default::default()
            },
            shutdown,
        }
    }

    /// Pins the worker to `cpu` instead of the one its id maps to.
    pub fn pin_to(mut self, cpu: usize) -> Self {
        self.cpu = cpu;
        self.options.pin_cpu = true;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Runs the worker to completion on the calling thread.
    pub fn run(mut self) -> WorkerReport {
        if self.options.pin_cpu {
            let cpu = self.cpu;
            match pin_current_thread(cpu) {
                Ok(()) => {
                    log::debug!("Worker {} pinned to CPU {cpu}", self.id);
                    self.stats.pinned_cpu = Some(cpu);
                }
                Err(e) => log::warn!("Worker {} could not be pinned to CPU {cpu}: {e}", self.id),
            }
        }
        self.transition(WorkerState::Running);

        let exit = loop {
            if self.stats.remaining_budget == Some(0) {
                break WorkerExit::BudgetExhausted;
            }
            if self.shutdown.is_cancelled() {
                break WorkerExit::Shutdown;
            }
            match self.step() {
                Ok(true) => break WorkerExit::BudgetExhausted,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Worker {} stopped: {e}", self.id);
                    break WorkerExit::Failed(e);
                }
            }
        };

        if let Some(kernel) = self.source.statistics() {
            self.stats.kernel_packets = kernel.packets;
            self.stats.kernel_drops = kernel.drops;
            if kernel.drops > 0 {
                log::warn!(
                    "Worker {}: kernel dropped {} of {} packets ({} ring freezes)",
                    self.id,
                    kernel.drops,
                    kernel.packets,
                    kernel.freeze_count
                );
            }
        }
        self.transition(WorkerState::Stopped);
        log::info!(
            "Worker {} stopped ({exit:?}): {} blocks, {} frames, {} bytes",
            self.id,
            self.stats.blocks,
            self.stats.frames,
            self.stats.bytes
        );
        WorkerReport {
            id: self.id,
            stats: self.stats,
            exit,
        }
    }

    /// Processes at most one block.
    ///
    /// # Returns
    /// `Ok(true)` once the frame budget has run out and the block has been drained.
    fn step(&mut self) -> Result<bool, PollError> {
        let block_size = self.source.block_size() as u64;
        let Some(mut block) = self.source.next_block(self.options.poll_timeout)? else {
            self.stats.timeouts += 1;
            return Ok(false);
        };
        let block_offset = self.stats.blocks * block_size;
        self.stats.blocks += 1;
        if block.is_empty() {
            self.stats.empty_blocks += 1;
        }

        drain_block(
            self.id,
            &mut block,
            &mut self.consumer,
            &mut self.stats,
            &mut self.state,
            block_offset,
        );
        if block.violation().is_some() {
            self.stats.violations += 1;
        }
        block.retire();
        Ok(self.state == WorkerState::Draining)
    }

    fn transition(&mut self, next: WorkerState) {
        log::debug!("Worker {}: {:?} -> {next:?}", self.id, self.state);
        self.state = next;
    }
}

/// Walks every frame of `block`, forwarding them until the budget runs out and skipping
/// the rest.
fn drain_block<C: FrameConsumer>(
    id: usize,
    block: &mut BlockView<'_>,
    consumer: &mut C,
    stats: &mut WorkerStats,
    state: &mut WorkerState,
    block_offset: u64,
) {
    while let Some(frame) = block.next_frame() {
        if *state == WorkerState::Draining {
            stats.skipped += 1;
            continue;
        }
        log::trace!(
            "Worker {id}: frame of {} bytes at block offset {block_offset}",
            frame.captured_len()
        );
        stats.frames += 1;
        stats.bytes += frame.captured_len() as u64;
        if frame.is_truncated() {
            stats.truncated += 1;
        }
        consumer.consume(&frame, block_offset);
        if let Some(remaining) = stats.remaining_budget.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                log::info!("Worker {id}: frame budget exhausted, draining block");
                *state = WorkerState::Draining;
            }
        }
    }
}
