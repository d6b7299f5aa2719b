//! # Worker Dispatch
//!
//! ## Purpose
//!
//! Starts one capture worker per configured thread and collects their reports at the end.
//! Each worker owns its own socket and ring; the kernel spreads traffic between them through
//! a shared fan-out group.
//!
//! ## How it works
//!
//! `Dispatcher::start` validates the configuration and binds every socket before the first
//! thread exists, so a bad interface or missing capability fails the whole start with
//! nothing left running. Workers are then spawned as named threads sharing one cancellation
//! token. `request_stop` cancels it; every worker notices within one poll timeout, finishes
//! the block it holds and returns its report through `join`.
//!
//! ## Main components
//!
//! - `Dispatcher`: worker handles plus the shared shutdown token.
//! - `open_sockets()`: binds the per-worker sockets for a configuration.

use crate::config::CaptureConfig;
use crate::create::CaptureSocketBuilder;
use crate::error::Error;
use crate::socket::CaptureSocket;
use crate::source::BlockSource;
use crate::worker::{FrameConsumer, Worker, WorkerExit, WorkerOptions, WorkerReport, WorkerStats};
use std::any::Any;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

pub struct Dispatcher {
    handles: Vec<JoinHandle<WorkerReport>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Binds one socket per worker on the configured interface and starts the workers.
    ///
    /// # Arguments
    /// * `config` - The capture run; validated here.
    /// * `make_consumer` - Called with each worker id to build that worker's consumer.
    /// * `shutdown` - Cancelled to stop every worker.
    ///
    /// # Errors
    /// `Error::Config` or `Error::Bind` before any thread is started. `Error::Spawn` if the
    /// OS refuses a thread; workers already started are stopped and joined first.
    pub fn start<C, F>(
        config: &CaptureConfig,
        make_consumer: F,
        shutdown: CancellationToken,
    ) -> Result<Self, Error>
    where
        C: FrameConsumer + 'static,
        F: FnMut(usize) -> C,
    {
        config.validate()?;
        let sockets = open_sockets(config)?;
        log::info!(
            "Capturing on {} with {} worker(s), fan-out group {:?}",
            config.interface,
            sockets.len(),
            config.fanout_group()
        );
        Self::spawn(sockets, make_consumer, config.worker_options(), shutdown)
    }

    /// Starts one worker per source.
    pub fn spawn<S, C, F>(
        sources: Vec<S>,
        mut make_consumer: F,
        options: WorkerOptions,
        shutdown: CancellationToken,
    ) -> Result<Self, Error>
    where
        S: BlockSource + 'static,
        C: FrameConsumer + 'static,
        F: FnMut(usize) -> C,
    {
        let mut handles = Vec::with_capacity(sources.len());
        for (id, source) in sources.into_iter().enumerate() {
            let worker = Worker::new(id, source, make_consumer(id), options, shutdown.clone());
            let spawned = thread::Builder::new()
                .name(format!("capture-{id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    log::error!("Failed to spawn worker {id}: {source}");
                    shutdown.cancel();
                    let _ = join_all(handles);
                    return Err(Error::Spawn { id, source });
                }
            }
        }
        Ok(Dispatcher { handles, shutdown })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// The token shared by every worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Asks every worker to stop after its current block.
    pub fn request_stop(&self) {
        self.shutdown.cancel();
    }

    /// Waits for every worker and returns their reports in worker-id order.
    ///
    /// A worker that panicked is reported as `WorkerExit::Panicked`; the panic does not
    /// propagate.
    pub fn join(self) -> Vec<WorkerReport> {
        join_all(self.handles)
    }
}

fn join_all(handles: Vec<JoinHandle<WorkerReport>>) -> Vec<WorkerReport> {
    handles
        .into_iter()
        .enumerate()
        .map(|(id, handle)| match handle.join() {
            Ok(report) => report,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Worker {id} panicked: {message}");
                WorkerReport {
                    id,
                    stats: WorkerStats::default(),
                    exit: WorkerExit::Panicked(message),
                }
            }
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Binds `config.threads` sockets on `config.interface`, joined to the fan-out group when
/// the configuration calls for one.
///
/// Sockets bound before a failure are closed when the partial result is dropped.
pub fn open_sockets(config: &CaptureConfig) -> Result<Vec<CaptureSocket>, Error> {
    let mut builder = CaptureSocketBuilder::new(config.socket_kind, config.ring_config()?)?
        .promiscuous(config.promiscuous);
    if let Some(group_id) = config.fanout_group() {
        builder = builder.fanout(config.fanout, group_id);
    }
    (0..config.threads)
        .map(|_| builder.bind(&config.interface).map_err(Error::from))
        .collect()
}
