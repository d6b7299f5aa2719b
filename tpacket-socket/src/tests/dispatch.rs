#![cfg(test)]

use super::{BLOCK_SIZE, consumer, init_logger, tag_of, tagged};
use crate::config::CaptureConfig;
use crate::dispatch::Dispatcher;
use crate::error::{BindStep, ConfigError, Error};
use crate::synthetic::{SyntheticRing, round_robin};
use crate::worker::{NullConsumer, WorkerExit, WorkerOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn options() -> WorkerOptions {
    WorkerOptions {
        poll_timeout: Duration::from_millis(5),
        frame_budget: None,
        pin_cpu: false,
    }
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_fanout_delivers_each_frame_once() {
    init_logger();
    const WORKERS: usize = 3;
    const FRAMES: u32 = 90;

    let frames: Vec<_> = (0..FRAMES).map(|tag| tagged(tag, 100)).collect();
    let mut rings: Vec<_> = (0..WORKERS)
        .map(|_| SyntheticRing::new(BLOCK_SIZE, 16).unwrap())
        .collect();
    round_robin(&frames, &mut rings, 4).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Dispatcher::spawn(
        rings,
        |id| {
            let sink = seen.clone();
            consumer(move |frame, _offset| sink.lock().unwrap().push((id, tag_of(frame.data()))))
        },
        options(),
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(dispatcher.worker_count(), WORKERS);

    let complete = wait_for(Duration::from_secs(5), || {
        seen.lock().unwrap().len() >= FRAMES as usize
    });
    dispatcher.request_stop();
    let reports = dispatcher.join();
    assert!(complete, "only {} frames delivered", seen.lock().unwrap().len());

    let mut owner = HashMap::new();
    for (worker, tag) in seen.lock().unwrap().iter().copied() {
        assert!(owner.insert(tag, worker).is_none(), "frame {tag} delivered twice");
    }
    assert_eq!(owner.len(), FRAMES as usize);
    for (tag, worker) in owner {
        assert_eq!(worker, tag as usize % WORKERS);
    }

    assert_eq!(reports.len(), WORKERS);
    for (id, report) in reports.iter().enumerate() {
        assert_eq!(report.id, id);
        assert!(matches!(report.exit, WorkerExit::Shutdown));
        assert_eq!(report.stats.frames, FRAMES as u64 / WORKERS as u64);
    }
}

#[test]
fn test_arrival_order_within_worker() {
    let frames: Vec<_> = (0..40).map(|tag| tagged(tag, 64)).collect();
    let mut rings = vec![SyntheticRing::new(BLOCK_SIZE, 16).unwrap()];
    round_robin(&frames, &mut rings, 7).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let options = WorkerOptions {
        frame_budget: Some(40),
        ..options()
    };
    let sink = seen.clone();
    let dispatcher = Dispatcher::spawn(
        rings,
        move |_| {
            let sink = sink.clone();
            consumer(move |frame, offset| sink.lock().unwrap().push((tag_of(frame.data()), offset)))
        },
        options,
        CancellationToken::new(),
    )
    .unwrap();
    let reports = dispatcher.join();

    assert!(matches!(reports[0].exit, WorkerExit::BudgetExhausted));
    let seen = seen.lock().unwrap();
    let tags: Vec<u32> = seen.iter().map(|&(tag, _)| tag).collect();
    assert_eq!(tags, (0..40).collect::<Vec<_>>());
    for (i, &(_, offset)) in seen.iter().enumerate() {
        assert_eq!(offset, (i / 7 * BLOCK_SIZE) as u64);
    }
}

#[test]
fn test_panicking_worker_is_reported() {
    init_logger();
    let mut rings: Vec<_> = (0..2)
        .map(|_| SyntheticRing::new(BLOCK_SIZE, 4).unwrap())
        .collect();
    round_robin(&[tagged(0, 64), tagged(1, 64)], &mut rings, 1).unwrap();

    let options = WorkerOptions {
        frame_budget: Some(1),
        ..options()
    };
    let dispatcher = Dispatcher::spawn(
        rings,
        |id| {
            consumer(move |_frame, _offset| {
                if id == 1 {
                    panic!("consumer failed");
                }
            })
        },
        options,
        CancellationToken::new(),
    )
    .unwrap();
    let reports = dispatcher.join();

    assert!(matches!(reports[0].exit, WorkerExit::BudgetExhausted));
    assert_eq!(reports[0].stats.frames, 1);
    match &reports[1].exit {
        WorkerExit::Panicked(message) => assert!(message.contains("consumer failed")),
        other => panic!("unexpected exit {other:?}"),
    }
    assert!(reports[1].is_failure());
}

#[test]
fn test_stop_bounded_by_poll_timeout() {
    let rings: Vec<_> = (0..4)
        .map(|_| SyntheticRing::new(BLOCK_SIZE, 2).unwrap())
        .collect();
    let token = CancellationToken::new();
    let dispatcher = Dispatcher::spawn(rings, |_| NullConsumer, options(), token.clone()).unwrap();
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    token.cancel();
    let reports = dispatcher.join();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(reports.iter().all(|r| matches!(r.exit, WorkerExit::Shutdown)));
    assert!(reports.iter().all(|r| r.stats.timeouts > 0));
}

#[test]
fn test_invalid_config_starts_nothing() {
    let mut config = CaptureConfig::new("lo");
    config.block_size_kb = 5;
    let err = Dispatcher::start(&config, |_| NullConsumer, CancellationToken::new())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Config(ConfigError::BlockSizeTooSmall { .. })
    ));

    let mut config = CaptureConfig::new("lo");
    config.threads = 0;
    assert!(matches!(
        Dispatcher::start(&config, |_| NullConsumer, CancellationToken::new()),
        Err(Error::Config(ConfigError::ZeroThreads))
    ));
}

#[test]
fn test_unknown_interface_starts_nothing() {
    let mut config = CaptureConfig::new("nosuchif0");
    config.block_size_kb = 64;
    config.block_count = 16;
    let err = Dispatcher::start(&config, |_| NullConsumer, CancellationToken::new())
        .err()
        .unwrap();
    match err {
        Error::Bind(bind) => assert_eq!(bind.step(), Some(BindStep::ResolveInterface)),
        other => panic!("unexpected error {other}"),
    }
}
