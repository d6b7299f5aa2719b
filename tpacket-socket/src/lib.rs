// Public modules and re-exports
pub mod affinity;
pub mod block;
pub mod config;
pub mod create;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod mmap;
pub mod ring;
pub mod socket;
pub mod source;
pub mod worker;

pub use block::BlockView;
pub use config::{CaptureConfig, Fanout, FanoutMode, RingConfig, SocketKind};
pub use create::CaptureSocketBuilder;
pub use dispatch::{Dispatcher, open_sockets};
pub use error::{
    BindError, BindStep, ConfigError, Error, PollError, ProtocolViolation, ViolationKind,
};
pub use frame::FrameView;
pub use socket::{CaptureSocket, SocketStats};
pub use source::BlockSource;
pub use worker::{
    FrameConsumer, NullConsumer, Worker, WorkerExit, WorkerOptions, WorkerReport, WorkerState,
    WorkerStats,
};

pub use tokio_util::sync::CancellationToken;

// Internal modules, hidden from documentation
#[doc(hidden)]
pub mod poll;
#[doc(hidden)]
pub mod synthetic;

#[cfg(test)]
mod tests;
