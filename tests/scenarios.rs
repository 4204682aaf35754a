//! End-to-end scenarios: two engines talking over loopback sockets, with an
//!  in-test UDP relay where chunks need to be intercepted.
//!
//! Both engines bind known local ports so each side can list the other as
//!  its path remote (the receive filter admits only the configured peer).
//!  The relay sits between them for the loss scenarios: it parses each
//!  datagram's chunk header and applies a per-test rule - forward, drop,
//!  or hold for later release.

use anyhow::Result;
use bytes::Bytes;
use pathweave::{
    Chunk, Engine, EngineConfig, FrameId, FrameSink, FrameSource, PathConfig, Strategy,
    TransportError,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const PAYLOAD_SIZE: usize = 100;
const JITTER_WINDOW: Duration = Duration::from_millis(150);

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Grabs a free loopback port by binding and immediately releasing it.
fn alloc_addr() -> SocketAddr {
    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<(u32, Vec<u8>)>>,
}

impl FrameSink for RecordingSink {
    fn on_frame_ready(&self, frame_id: FrameId, payload: Bytes) {
        self.frames
            .lock()
            .unwrap()
            .push((frame_id.to_raw(), payload.to_vec()));
    }
}

impl RecordingSink {
    fn emitted(&self) -> Vec<(u32, Vec<u8>)> {
        self.frames.lock().unwrap().clone()
    }

    fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(u32, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        loop {
            let emitted = self.emitted();
            if emitted.len() >= count || Instant::now() >= deadline {
                return emitted;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn base_config(paths: Vec<PathConfig>) -> EngineConfig {
    let mut config = EngineConfig::new(paths);
    config.payload_size = PAYLOAD_SIZE;
    config.k = 4;
    config.r = 2;
    config.jitter_window = JITTER_WINDOW;
    config.flush_interval = Duration::from_millis(10);
    config
}

fn frame_payload(i: u32) -> Vec<u8> {
    format!("frame-{:04}", i).into_bytes()
}

/// What the relay does with one intercepted chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RelayAction {
    Forward,
    Drop,
    Hold,
}

/// A UDP man-in-the-middle: receives the sender's datagrams, parses the
///  chunk header and forwards, drops or parks each one per the rule.
struct Relay {
    in_addr: SocketAddr,
    out_addr: SocketAddr,
    out_socket: Arc<UdpSocket>,
    held: Arc<Mutex<Vec<(u32, Bytes)>>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    fn start(
        forward_to: SocketAddr,
        rule: impl Fn(&Chunk) -> RelayAction + Send + 'static,
    ) -> Result<Relay> {
        let in_socket = UdpSocket::bind("127.0.0.1:0")?;
        in_socket.set_nonblocking(true)?;
        let in_addr = in_socket.local_addr()?;

        let out_socket = Arc::new(UdpSocket::bind("127.0.0.1:0")?);
        out_socket.connect(forward_to)?;
        let out_addr = out_socket.local_addr()?;

        let held = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let thread_out = out_socket.clone();
        let thread_held = held.clone();
        let thread_running = running.clone();
        let thread = std::thread::spawn(move || {
            let mut buf = vec![0u8; 12 + PAYLOAD_SIZE];
            while thread_running.load(Ordering::Relaxed) {
                match in_socket.recv(&mut buf) {
                    Ok(len) => {
                        let raw = Bytes::copy_from_slice(&buf[..len]);
                        let mut cursor = raw.clone();
                        let action = match Chunk::deser(&mut cursor, PAYLOAD_SIZE) {
                            Ok(chunk) => {
                                let action = rule(&chunk);
                                if action == RelayAction::Hold {
                                    thread_held
                                        .lock()
                                        .unwrap()
                                        .push((chunk.frame_id.to_raw(), raw.clone()));
                                }
                                action
                            }
                            Err(_) => RelayAction::Forward,
                        };
                        if action == RelayAction::Forward {
                            let _ = thread_out.send(&raw);
                        }
                    }
                    Err(_) => std::thread::sleep(Duration::from_millis(1)),
                }
            }
        });

        Ok(Relay {
            in_addr,
            out_addr,
            out_socket,
            held,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Forwards everything held back so far, after `reorder` had its way
    ///  with the list of `(frame_id, datagram)` pairs.
    fn release_held(&self, reorder: impl FnOnce(&mut Vec<(u32, Bytes)>)) {
        let mut held = std::mem::take(&mut *self.held.lock().unwrap());
        reorder(&mut held);
        for (_, datagram) in held {
            let _ = self.out_socket.send(&datagram);
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sender and receiver wired directly to each other over one path.
fn direct_pair() -> Result<(Engine, Engine, Arc<RecordingSink>)> {
    let sender_addr = alloc_addr();
    let receiver_addr = alloc_addr();

    let sender = Engine::new(
        base_config(vec![PathConfig::with_local(receiver_addr, sender_addr)]),
        Arc::new(RecordingSink::default()),
    )?;
    let sink = Arc::new(RecordingSink::default());
    let receiver = Engine::new(
        base_config(vec![PathConfig::with_local(sender_addr, receiver_addr)]),
        sink.clone(),
    )?;
    Ok((sender, receiver, sink))
}

/// Sender and receiver with the relay in between.
fn relayed_pair(
    rule: impl Fn(&Chunk) -> RelayAction + Send + 'static,
) -> Result<(Engine, Engine, Arc<RecordingSink>, Relay)> {
    let sender_addr = alloc_addr();
    let receiver_addr = alloc_addr();

    let relay = Relay::start(receiver_addr, rule)?;

    let sender = Engine::new(
        base_config(vec![PathConfig::with_local(relay.in_addr, sender_addr)]),
        Arc::new(RecordingSink::default()),
    )?;
    let sink = Arc::new(RecordingSink::default());
    let receiver = Engine::new(
        base_config(vec![PathConfig::with_local(relay.out_addr, receiver_addr)]),
        sink.clone(),
    )?;
    Ok((sender, receiver, sink, relay))
}

fn send_frames(sender: &Engine, ids: impl IntoIterator<Item = u32>) -> Result<(), TransportError> {
    for i in ids {
        sender.send_frame(FrameId::from_raw(i), &frame_payload(i))?;
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

#[test]
fn s1_lossless_single_path() -> Result<()> {
    let (sender, receiver, sink) = direct_pair()?;
    sender.start();
    receiver.start();

    send_frames(&sender, 0..10)?;
    let emitted = sink.wait_for(10, Duration::from_secs(3));

    sender.stop();
    receiver.stop();

    let expected: Vec<(u32, Vec<u8>)> = (0..10).map(|i| (i, frame_payload(i))).collect();
    assert_eq!(emitted, expected);
    Ok(())
}

#[test]
fn s2_one_chunk_dropped_per_frame() -> Result<()> {
    let (sender, receiver, sink, relay) = relayed_pair(|chunk| {
        if chunk.chunk_id == 1 {
            RelayAction::Drop
        }
        else {
            RelayAction::Forward
        }
    })?;
    sender.start();
    receiver.start();

    send_frames(&sender, 0..10)?;
    let emitted = sink.wait_for(10, Duration::from_secs(3));

    sender.stop();
    receiver.stop();
    relay.stop();

    // every frame lost one data chunk and was reconstructed via parity
    let expected: Vec<(u32, Vec<u8>)> = (0..10).map(|i| (i, frame_payload(i))).collect();
    assert_eq!(emitted, expected);
    Ok(())
}

#[test]
fn s3_more_than_r_chunks_dropped() -> Result<()> {
    let (sender, receiver, sink, relay) = relayed_pair(|chunk| {
        if chunk.frame_id.to_raw() == 5 && chunk.chunk_id <= 2 {
            RelayAction::Drop
        }
        else {
            RelayAction::Forward
        }
    })?;
    sender.start();
    receiver.start();

    send_frames(&sender, 0..10)?;
    let emitted = sink.wait_for(9, Duration::from_secs(3));

    // the unrecoverable frame must land in the drop record within two
    //  jitter windows of its arrival
    std::thread::sleep(2 * JITTER_WINDOW);
    let dropped = receiver.recent_dropped_frames();

    sender.stop();
    receiver.stop();
    relay.stop();

    let emitted_ids: Vec<u32> = emitted.iter().map(|(id, _)| *id).collect();
    assert_eq!(emitted_ids, vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);
    for (id, payload) in &emitted {
        assert_eq!(payload, &frame_payload(*id));
    }
    assert!(dropped.contains(&FrameId::from_raw(5)));
    assert_eq!(receiver.stats().collector.frames_skipped, 1);
    Ok(())
}

#[test]
fn s4_black_holed_path_goes_inactive() -> Result<()> {
    let sender_addr = alloc_addr();
    let receiver_addr = alloc_addr();
    // nothing ever listens here: a silent black hole
    let dead_addr = alloc_addr();

    let mut config = base_config(vec![
        PathConfig::with_local(receiver_addr, sender_addr),
        PathConfig::new(dead_addr),
    ]);
    config.strategy = Strategy::Adaptive;
    config.monitor_interval = Duration::from_millis(50);
    let sender = Engine::new(config, Arc::new(RecordingSink::default()))?;

    let sink = Arc::new(RecordingSink::default());
    let receiver = Engine::new(
        base_config(vec![PathConfig::with_local(sender_addr, receiver_addr)]),
        sink.clone(),
    )?;

    sender.start();
    receiver.start();

    // the harness knows the path is black-holed and attributes the loss;
    //  in deployment this comes from receiver feedback
    for _ in 0..5 {
        sender.record_packet_lost(dead_addr);
    }

    send_frames(&sender, 0..20)?;
    let emitted = sink.wait_for(20, Duration::from_secs(3));

    // three monitor intervals at 50 ms plus slack
    std::thread::sleep(Duration::from_millis(300));
    let stats = sender.stats();

    sender.stop();
    receiver.stop();

    let expected: Vec<(u32, Vec<u8>)> = (0..20).map(|i| (i, frame_payload(i))).collect();
    assert_eq!(emitted, expected);

    let dead_path = stats
        .paths
        .iter()
        .find(|p| p.remote == dead_addr)
        .expect("black-holed path must be in the stats");
    assert!(!dead_path.is_active);
    Ok(())
}

#[test]
fn s5_out_of_order_arrival() -> Result<()> {
    let (sender, receiver, sink, relay) = relayed_pair(|_| RelayAction::Hold)?;
    sender.start();
    receiver.start();

    send_frames(&sender, 0..5)?;
    // let everything reach the relay, then replay in reverse frame order
    std::thread::sleep(Duration::from_millis(100));
    relay.release_held(|held| {
        held.sort_by(|(a, _), (b, _)| b.cmp(a));
    });

    let emitted = sink.wait_for(5, Duration::from_secs(3));

    sender.stop();
    receiver.stop();
    relay.stop();

    let expected: Vec<(u32, Vec<u8>)> = (0..5).map(|i| (i, frame_payload(i))).collect();
    assert_eq!(emitted, expected);
    Ok(())
}

#[test]
fn s6_late_chunks_after_deadline() -> Result<()> {
    let (sender, receiver, sink, relay) = relayed_pair(|chunk| {
        if chunk.frame_id.to_raw() == 7 {
            RelayAction::Hold
        }
        else {
            RelayAction::Forward
        }
    })?;
    sender.start();
    receiver.start();

    send_frames(&sender, 0..10)?;
    let emitted = sink.wait_for(9, Duration::from_secs(3));
    let emitted_ids: Vec<u32> = emitted.iter().map(|(id, _)| *id).collect();
    assert_eq!(emitted_ids, vec![0, 1, 2, 3, 4, 5, 6, 8, 9]);

    // frame 7 turns up well past the deadline: silently discarded, and
    //  later frames are unaffected
    std::thread::sleep(JITTER_WINDOW + Duration::from_millis(10));
    relay.release_held(|_| {});
    std::thread::sleep(Duration::from_millis(100));

    send_frames(&sender, 10..12)?;
    let emitted = sink.wait_for(11, Duration::from_secs(3));

    sender.stop();
    receiver.stop();
    relay.stop();

    let emitted_ids: Vec<u32> = emitted.iter().map(|(id, _)| *id).collect();
    assert_eq!(emitted_ids, vec![0, 1, 2, 3, 4, 5, 6, 8, 9, 10, 11]);
    assert!(receiver.stats().collector.stale_chunks > 0);
    Ok(())
}

#[test]
fn internal_producer_drives_frames() -> Result<()> {
    struct CountingSource {
        next: Mutex<u32>,
    }
    impl FrameSource for CountingSource {
        fn next_frame(&self) -> Option<(FrameId, Bytes)> {
            let mut next = self.next.lock().unwrap();
            if *next >= 5 {
                return None;
            }
            let id = *next;
            *next += 1;
            Some((FrameId::from_raw(id), Bytes::from(frame_payload(id))))
        }
    }

    let (mut sender, receiver, sink) = direct_pair()?;
    sender.set_frame_source(Arc::new(CountingSource {
        next: Mutex::new(0),
    }));
    sender.start();
    receiver.start();

    let emitted = sink.wait_for(5, Duration::from_secs(3));

    sender.stop();
    receiver.stop();

    let expected: Vec<(u32, Vec<u8>)> = (0..5).map(|i| (i, frame_payload(i))).collect();
    assert_eq!(emitted, expected);
    Ok(())
}

#[test]
fn frames_survive_spraying_across_two_paths() -> Result<()> {
    // round-robin over two healthy paths: every frame arrives split across
    //  both sockets and still reassembles byte-exactly
    let sender_a = alloc_addr();
    let sender_b = alloc_addr();
    let receiver_a = alloc_addr();
    let receiver_b = alloc_addr();

    let mut sender_config = base_config(vec![
        PathConfig::with_local(receiver_a, sender_a),
        PathConfig::with_local(receiver_b, sender_b),
    ]);
    sender_config.strategy = Strategy::RoundRobin;
    let sender = Engine::new(sender_config, Arc::new(RecordingSink::default()))?;

    let sink = Arc::new(RecordingSink::default());
    let receiver = Engine::new(
        base_config(vec![
            PathConfig::with_local(sender_a, receiver_a),
            PathConfig::with_local(sender_b, receiver_b),
        ]),
        sink.clone(),
    )?;

    sender.start();
    receiver.start();

    send_frames(&sender, 0..10)?;
    let emitted = sink.wait_for(10, Duration::from_secs(3));

    let stats = sender.stats();
    sender.stop();
    receiver.stop();

    let expected: Vec<(u32, Vec<u8>)> = (0..10).map(|i| (i, frame_payload(i))).collect();
    assert_eq!(emitted, expected);

    // 10 frames x 6 chunks, alternating: both paths carried traffic
    assert_eq!(stats.paths[0].packets_sent, 30);
    assert_eq!(stats.paths[1].packets_sent, 30);
    Ok(())
}
