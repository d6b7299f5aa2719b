//! Live capture on the loopback interface. Needs `CAP_NET_RAW`; without it every test
//! returns early.

use caps::{CapSet, Capability};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tpacket_socket::mmap::page_size;
use tpacket_socket::{
    CaptureConfig, CaptureSocketBuilder, CancellationToken, Dispatcher, FrameConsumer, FrameView,
    PollError, RingConfig, SocketKind, WorkerExit,
};

fn can_capture() -> bool {
    let _ = env_logger::builder().is_test(true).try_init();
    let allowed = caps::has_cap(None, CapSet::Effective, Capability::CAP_NET_RAW).unwrap_or(false);
    if !allowed {
        log::warn!("CAP_NET_RAW not in the effective set, skipping loopback capture");
    }
    allowed
}

fn send_udp(marker: &[u8], count: usize) {
    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let target = receiver.local_addr().unwrap();
    for _ in 0..count {
        sender.send_to(marker, target).unwrap();
    }
}

struct MarkerCounter {
    marker: &'static [u8],
    matched: Arc<AtomicU64>,
}

impl FrameConsumer for MarkerCounter {
    fn consume(&mut self, frame: &FrameView<'_>, _block_offset: u64) {
        if contains(frame.data(), self.marker) {
            self.matched.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_capture_udp_on_loopback() {
    if !can_capture() {
        return;
    }
    let ring = RingConfig::new(page_size() as u32 * 16, 16, 20);
    let mut socket = CaptureSocketBuilder::new(SocketKind::Raw, ring)
        .unwrap()
        .bind("lo")
        .unwrap();
    assert_eq!(socket.interface(), "lo");
    assert!(socket.if_index() > 0);

    let marker = b"tpacket-loopback-marker";
    send_udp(marker, 3);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut found = 0;
    while found == 0 && Instant::now() < deadline {
        let Some(mut block) = socket.next_block(Duration::from_millis(100)).unwrap() else {
            continue;
        };
        while let Some(frame) = block.next_frame() {
            if contains(frame.data(), marker) {
                assert_eq!(frame.protocol(), libc::ETH_P_IP as u16);
                assert!(frame.captured_len() <= frame.original_len());
                assert!(frame.timestamp() > Duration::ZERO);
                found += 1;
            }
        }
        block.retire();
    }
    assert!(found > 0, "marker never captured");

    let stats = socket.statistics().unwrap();
    assert!(stats.packets >= found);

    socket.close();
    socket.close();
    assert!(socket.is_closed());
    assert!(matches!(
        socket.next_block(Duration::ZERO),
        Err(PollError::Closed)
    ));
}

#[test]
fn test_idle_socket_times_out() {
    if !can_capture() {
        return;
    }
    // A datagram socket on lo with a short retire timeout: any block that does show up
    // either carries traffic from elsewhere on the host or is an empty timed-out block.
    let ring = RingConfig::new(page_size() as u32, 16, 5);
    let mut socket = CaptureSocketBuilder::new(SocketKind::Datagram, ring)
        .unwrap()
        .bind("lo")
        .unwrap();
    for _ in 0..3 {
        if let Some(mut block) = socket.next_block(Duration::from_millis(20)).unwrap() {
            if block.is_empty() {
                assert!(block.next_frame().is_none());
            }
            while block.next_frame().is_some() {}
            block.retire();
        }
    }
}

#[test]
fn test_dispatcher_with_fanout_on_loopback() {
    if !can_capture() {
        return;
    }
    let mut config = CaptureConfig::new("lo");
    config.threads = 2;
    config.block_size_kb = 64;
    config.block_count = 16;
    config.block_timeout = Duration::from_millis(20);
    config.poll_timeout = Duration::from_millis(50);
    config.promiscuous = false;

    let marker: &'static [u8] = b"tpacket-fanout-marker";
    let matched = Arc::new(AtomicU64::new(0));
    let token = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        &config,
        |_| MarkerCounter {
            marker,
            matched: matched.clone(),
        },
        token.clone(),
    )
    .unwrap();

    send_udp(marker, 20);
    let deadline = Instant::now() + Duration::from_secs(5);
    while matched.load(Ordering::Relaxed) < 20 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    token.cancel();
    let reports = dispatcher.join();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| matches!(r.exit, WorkerExit::Shutdown)));
    assert!(matched.load(Ordering::Relaxed) >= 20);
}
