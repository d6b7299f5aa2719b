#![cfg(test)]

use super::{BLOCK_SIZE, consumer, init_logger, put_u32, tag_of, tagged};
use crate::block::BlockView;
use crate::error::PollError;
use crate::source::BlockSource;
use crate::synthetic::SyntheticRing;
use crate::worker::{NullConsumer, Worker, WorkerExit, WorkerOptions, WorkerState};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn options(frame_budget: Option<u64>) -> WorkerOptions {
    WorkerOptions {
        poll_timeout: Duration::from_millis(5),
        frame_budget,
        pin_cpu: false,
    }
}

fn filled_ring(blocks: &[&[u32]]) -> SyntheticRing {
    let mut ring = SyntheticRing::new(BLOCK_SIZE, 8).unwrap();
    for tags in blocks {
        let frames: Vec<_> = tags.iter().map(|&tag| tagged(tag, 64)).collect();
        ring.push_block(&frames).unwrap();
    }
    ring
}

#[test]
fn test_budget_stops_worker() {
    init_logger();
    let ring = filled_ring(&[&[1, 2, 3], &[4, 5]]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let record = consumer(move |frame, offset| {
        sink.lock().unwrap().push((tag_of(frame.data()), offset));
    });

    let worker = Worker::new(0, ring, record, options(Some(5)), CancellationToken::new());
    assert_eq!(worker.state(), WorkerState::Starting);
    let report = worker.run();

    assert!(matches!(report.exit, WorkerExit::BudgetExhausted));
    assert_eq!(report.stats.blocks, 2);
    assert_eq!(report.stats.frames, 5);
    assert_eq!(report.stats.bytes, 5 * 64);
    assert_eq!(report.stats.skipped, 0);
    assert_eq!(report.stats.remaining_budget, Some(0));
    let block = BLOCK_SIZE as u64;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(1, 0), (2, 0), (3, 0), (4, block), (5, block)]
    );
}

#[test]
fn test_budget_drains_rest_of_block() {
    let ring = filled_ring(&[&[1, 2, 3, 4], &[5, 6, 7, 8], &[9]]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let record = consumer(move |frame, _offset| {
        sink.lock().unwrap().push(tag_of(frame.data()));
    });

    let report = Worker::new(0, ring, record, options(Some(6)), CancellationToken::new()).run();

    assert!(matches!(report.exit, WorkerExit::BudgetExhausted));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(report.stats.frames, 6);
    assert_eq!(report.stats.skipped, 2);
    // The third block is never taken.
    assert_eq!(report.stats.blocks, 2);
}

#[test]
fn test_zero_budget_reads_nothing() {
    let ring = filled_ring(&[&[1]]);
    let report = Worker::new(0, ring, NullConsumer, options(Some(0)), CancellationToken::new()).run();
    assert!(matches!(report.exit, WorkerExit::BudgetExhausted));
    assert_eq!(report.stats.blocks, 0);
}

#[test]
fn test_shutdown_before_start() {
    let token = CancellationToken::new();
    token.cancel();
    let report = Worker::new(3, filled_ring(&[&[1]]), NullConsumer, options(None), token).run();
    assert_eq!(report.id, 3);
    assert!(matches!(report.exit, WorkerExit::Shutdown));
    assert_eq!(report.stats.blocks, 0);
    assert!(!report.is_failure());
}

#[test]
fn test_timeouts_until_shutdown() {
    init_logger();
    let token = CancellationToken::new();
    let ring = filled_ring(&[&[1, 2], &[]]);
    let stopper = token.clone();
    let handle = thread::spawn(move || {
        Worker::new(0, ring, NullConsumer, options(None), stopper).run()
    });
    thread::sleep(Duration::from_millis(50));
    token.cancel();
    let report = handle.join().unwrap();

    assert!(matches!(report.exit, WorkerExit::Shutdown));
    assert_eq!(report.stats.blocks, 2);
    assert_eq!(report.stats.empty_blocks, 1);
    assert_eq!(report.stats.frames, 2);
    assert!(report.stats.timeouts > 0);
    assert_eq!(report.stats.kernel_drops, 0);
}

#[test]
fn test_violation_counted_and_worker_continues() {
    init_logger();
    let mut ring = filled_ring(&[&[1, 2, 3], &[4]]);
    put_u32(ring.block_mut(0), 12, 5);

    let report = Worker::new(0, ring, NullConsumer, options(Some(4)), CancellationToken::new()).run();
    assert!(matches!(report.exit, WorkerExit::BudgetExhausted));
    assert_eq!(report.stats.violations, 1);
    assert_eq!(report.stats.frames, 4);
    assert_eq!(report.stats.blocks, 2);
}

#[test]
fn test_truncated_frames_counted() {
    let mut ring = SyntheticRing::new(BLOCK_SIZE, 2).unwrap();
    ring.push_block(&[tagged(1, 64).with_wire_len(1500), tagged(2, 64)])
        .unwrap();
    let report = Worker::new(0, ring, NullConsumer, options(Some(2)), CancellationToken::new()).run();
    assert_eq!(report.stats.truncated, 1);
    assert_eq!(report.stats.bytes, 128);
}

struct FailingSource;

impl BlockSource for FailingSource {
    fn next_block(&mut self, _timeout: Duration) -> Result<Option<BlockView<'_>>, PollError> {
        Err(PollError::Closed)
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }
}

#[test]
fn test_poll_failure_stops_worker() {
    let report = Worker::new(1, FailingSource, NullConsumer, options(None), CancellationToken::new()).run();
    assert!(matches!(report.exit, WorkerExit::Failed(PollError::Closed)));
    assert!(report.is_failure());
}

#[test]
fn test_pinning_records_cpu() {
    let handle = thread::spawn(|| {
        let cpu = unsafe { libc::sched_getcpu() } as usize;
        let report = Worker::new(0, filled_ring(&[&[1]]), NullConsumer, options(Some(1)), CancellationToken::new())
            .pin_to(cpu)
            .run();
        (cpu, report)
    });
    let (cpu, report) = handle.join().unwrap();
    assert!(matches!(report.exit, WorkerExit::BudgetExhausted));
    assert_eq!(report.stats.pinned_cpu, Some(cpu));
    assert_eq!(report.stats.frames, 1);
}

#[test]
fn test_pinning_failure_is_not_fatal() {
    init_logger();
    let handle = thread::spawn(|| {
        Worker::new(0, filled_ring(&[&[1]]), NullConsumer, options(Some(1)), CancellationToken::new())
            .pin_to(libc::CPU_SETSIZE as usize)
            .run()
    });
    let report = handle.join().unwrap();
    assert!(matches!(report.exit, WorkerExit::BudgetExhausted));
    assert_eq!(report.stats.pinned_cpu, None);
    assert_eq!(report.stats.frames, 1);
}
