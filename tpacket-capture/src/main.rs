use anyhow::Context as _;
use clap::{ArgAction, Parser, ValueEnum};
use std::collections::BTreeMap;
use std::time::Duration;
use tpacket_socket::{
    CancellationToken, CaptureConfig, Dispatcher, Fanout, FanoutMode, FrameConsumer, FrameView,
    SocketKind, WorkerExit,
};

#[derive(Parser, Debug)]
#[command(arg_required_else_help = true)]
struct Args {
    /// Interface to capture on
    interface: String,

    /// Number of worker threads, one ring each
    #[clap(short, long, default_value_t = 1)]
    threads: usize,

    /// Block size in KiB
    #[clap(long, default_value_t = 1024)]
    block_size_kb: u64,

    /// Number of blocks per ring
    #[clap(long, default_value_t = 2048)]
    blocks: u32,

    /// Hand over a partially filled block after this long, like 10s or 500ms
    #[clap(long, default_value = "10s", value_parser = humantime::parse_duration)]
    block_timeout: Duration,

    /// Fan-out mode shared by the workers
    #[clap(long, value_enum, default_value_t = Mode::Lb)]
    fanout: Mode,

    /// Do not move packets to another worker when one is backlogged
    #[clap(long)]
    no_rollover: bool,

    /// Defragment IP packets before fan-out
    #[clap(long)]
    defrag: bool,

    /// Fan-out group id; 0 derives one from the process id
    #[clap(long, default_value_t = 0)]
    fanout_id: u16,

    /// Leave the interface out of promiscuous mode
    #[clap(long)]
    no_promisc: bool,

    /// Stop each worker after this many frames
    #[clap(short = 'c', long)]
    count: Option<u64>,

    /// Longest single wait for a block, like 1s or 200ms
    #[clap(long, default_value = "1s", value_parser = humantime::parse_duration)]
    poll_timeout: Duration,

    /// Do not pin workers to CPUs
    #[clap(long)]
    no_pin: bool,

    /// Capture without link-layer headers
    #[clap(long)]
    cooked: bool,

    /// More logging; repeat for frame-level output
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Hash,
    Lb,
    Cpu,
    Rollover,
    Random,
    Qm,
}

impl From<Mode> for FanoutMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Hash => FanoutMode::Hash,
            Mode::Lb => FanoutMode::LoadBalance,
            Mode::Cpu => FanoutMode::Cpu,
            Mode::Rollover => FanoutMode::Rollover,
            Mode::Random => FanoutMode::Random,
            Mode::Qm => FanoutMode::QueueMapping,
        }
    }
}

impl Args {
    fn capture_config(&self) -> CaptureConfig {
        let mut config = CaptureConfig::new(self.interface.clone());
        config.threads = self.threads;
        config.block_size_kb = self.block_size_kb;
        config.block_count = self.blocks;
        config.block_timeout = self.block_timeout;
        config.fanout = Fanout {
            mode: self.fanout.into(),
            rollover: !self.no_rollover,
            defrag: self.defrag,
        };
        config.fanout_id = self.fanout_id;
        config.promiscuous = !self.no_promisc;
        config.frame_budget = self.count;
        config.poll_timeout = self.poll_timeout;
        config.pin_cpus = !self.no_pin;
        config.socket_kind = if self.cooked {
            SocketKind::Datagram
        } else {
            SocketKind::Raw
        };
        config
    }
}

/// Counts frames per EtherType and logs the tally when its worker is done.
struct FrameCounter {
    id: usize,
    by_protocol: BTreeMap<u16, u64>,
}

impl FrameConsumer for FrameCounter {
    fn consume(&mut self, frame: &FrameView<'_>, block_offset: u64) {
        log::trace!(
            "worker {}: {} of {} bytes, proto {:#06x}, if {}, block offset {}",
            self.id,
            frame.captured_len(),
            frame.original_len(),
            frame.protocol(),
            frame.if_index(),
            block_offset
        );
        *self.by_protocol.entry(frame.protocol()).or_default() += 1;
    }
}

impl Drop for FrameCounter {
    fn drop(&mut self) {
        for (protocol, frames) in &self.by_protocol {
            log::info!("worker {}: {frames} frames of proto {protocol:#06x}", self.id);
        }
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    match caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_NET_RAW) {
        Ok(true) => log::debug!("CAP_NET_RAW is effective"),
        Ok(false) => log::warn!("CAP_NET_RAW is not effective, opening capture sockets will fail"),
        Err(e) => log::warn!("Failed to read capabilities: {e}"),
    }

    let config = args.capture_config();
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        &config,
        |id| FrameCounter {
            id,
            by_protocol: BTreeMap::new(),
        },
        shutdown.clone(),
    )
    .with_context(|| format!("failed to start capture on {}", config.interface))?;

    let stopper = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, stopping workers");
            stopper.cancel();
        }
    });

    let reports = tokio::task::spawn_blocking(move || dispatcher.join())
        .await
        .context("worker join task failed")?;

    let mut frames = 0;
    let mut bytes = 0;
    let mut drops = 0;
    for report in &reports {
        frames += report.stats.frames;
        bytes += report.stats.bytes;
        drops += report.stats.kernel_drops;
        match &report.exit {
            WorkerExit::Failed(e) => log::error!("worker {} failed: {e}", report.id),
            WorkerExit::Panicked(message) => log::error!("worker {} panicked: {message}", report.id),
            _ => {}
        }
        log::info!("worker {}: {:?}", report.id, report.stats);
    }
    log::info!(
        "captured {frames} frames ({bytes} bytes) with {} workers, kernel dropped {drops}",
        reports.len()
    );
    Ok(())
}
