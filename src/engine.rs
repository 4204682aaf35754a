//! Lifecycle wiring: producer -> slicer + erasure coder -> scheduler ->
//!  endpoints -> network -> endpoints -> collector -> consumer.
//!
//! The engine owns every component and exposes only start/stop plus
//!  `send_frame` for applications that push frames themselves. Threads at
//!  runtime: one receive thread per endpoint, one metrics thread per
//!  monitor, the collector's flusher, a receive-dispatch thread that moves
//!  datagrams from the endpoint queues into the collector, and - when a
//!  `FrameSource` is configured - a producer thread that pulls frames and
//!  dispatches them. Sends happen on whichever thread calls `send_frame`;
//!  there are no dedicated send threads.
//!
//! Startup errors propagate to the caller and unwind whatever was already
//!  created. After a successful start the engine never returns errors -
//!  trouble shows up in the counters instead.

use crate::chunk::{Chunk, HEADER_SIZE};
use crate::collector::{CollectorStats, FrameSink, SmartCollector};
use crate::config::EngineConfig;
use crate::endpoint::PathEndpoint;
use crate::error::TransportError;
use crate::fec::ErasureCoder;
use crate::frame_id::FrameId;
use crate::monitor::PathMonitor;
use crate::path::PathCounters;
use crate::scheduler::{Scheduler, Strategy};
use crate::slicer;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Producer capability: the engine's producer thread pulls frames from it.
pub trait FrameSource: Send + Sync + 'static {
    /// The next frame to dispatch, or `None` if nothing is available right
    ///  now (the producer thread retries shortly).
    fn next_frame(&self) -> Option<(FrameId, Bytes)>;
}

/// Idle sleep of the dispatch and producer loops.
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const PRODUCER_IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Per-path slice of the engine statistics.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PathStats {
    pub remote: SocketAddr,
    pub is_active: bool,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub send_drops: u64,
    pub queue_overflows: u64,
    pub decode_errors: u64,
}

/// Running counters of the whole engine. Never resets while running.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EngineStats {
    pub paths: Vec<PathStats>,
    pub collector: CollectorStats,
    /// Chunks that found no active path at dispatch time.
    pub undeliverable_chunks: u64,
    /// Datagrams that arrived but did not parse as a chunk, summed over
    ///  the paths (the per-path split is in [`PathStats`]).
    pub decode_errors: u64,
}

/// The shared innards: everything the dispatch and producer threads need.
struct EngineCore {
    payload_size: usize,
    k: u16,
    r: u16,
    strategy: Strategy,
    scheduler: Arc<Scheduler>,
    endpoints: Vec<Arc<PathEndpoint>>,
    endpoint_index: FxHashMap<SocketAddr, usize>,
    collector: Arc<SmartCollector>,
    coder: ErasureCoder,
    undeliverable_chunks: AtomicU64,
}

impl EngineCore {
    /// Slices, encodes and dispatches one frame, choosing a path per chunk.
    fn send_frame(&self, frame_id: FrameId, frame: &[u8]) -> Result<(), TransportError> {
        let mut chunks = slicer::slice(frame, frame_id, self.k, self.r, self.payload_size)?;

        let data_payloads: Vec<Bytes> = chunks.iter().map(|c| c.payload.clone()).collect();
        let parity = self.coder.encode(&data_payloads)?;
        // parity chunks carry the frame total so the receiver can trim
        //  reconstruction exactly (fits u16 per config validation)
        let total = frame.len() as u16;
        for (j, parity_payload) in parity.into_iter().enumerate() {
            chunks.push(Chunk {
                frame_id,
                chunk_id: self.k + j as u16,
                k: self.k,
                r: self.r,
                chunk_size: total,
                payload: Bytes::from(parity_payload),
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload_size);
        for chunk in &chunks {
            match self.scheduler.get_next_path(self.strategy) {
                Some(remote) => {
                    buf.clear();
                    chunk.ser(&mut buf);
                    self.endpoints[self.endpoint_index[&remote]].send(&buf);
                }
                None => {
                    self.undeliverable_chunks.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "no active path for chunk {} of frame {}",
                        chunk.chunk_id, frame_id
                    );
                }
            }
        }
        Ok(())
    }

    /// Drains every endpoint queue once. Returns whether anything arrived.
    fn dispatch_once(&self) -> bool {
        let mut any = false;
        for endpoint in &self.endpoints {
            for mut datagram in endpoint.poll_receive() {
                any = true;
                match Chunk::deser(&mut datagram, self.payload_size) {
                    Ok(chunk) => {
                        self.scheduler.record_receive(endpoint.remote());
                        self.collector.push_chunk(chunk);
                    }
                    Err(e) => {
                        endpoint.counters().record_decode_error();
                        debug!("dropping undecodable datagram from {:?}: {}", endpoint.remote(), e);
                    }
                }
            }
        }
        any
    }
}

pub struct Engine {
    core: Arc<EngineCore>,
    monitors: Vec<PathMonitor>,
    source: Option<Arc<dyn FrameSource>>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validates the configuration and creates all components, binding one
    ///  socket per path. Any failure unwinds what was already created and
    ///  propagates.
    pub fn new(config: EngineConfig, sink: Arc<dyn FrameSink>) -> Result<Engine, TransportError> {
        config.validate()?;

        let coder = ErasureCoder::new(config.k, config.r)?;
        let scheduler = Arc::new(Scheduler::new());

        let mut endpoints = Vec::with_capacity(config.paths.len());
        let mut endpoint_index = FxHashMap::default();
        for path in &config.paths {
            let endpoint = Arc::new(PathEndpoint::new(
                path,
                config.payload_size,
                config.receive_queue_capacity,
                config.receive_poll_cap,
            )?);
            endpoint_index.insert(path.remote, endpoints.len());
            endpoints.push(endpoint);
            scheduler.add_path(path.remote);
        }

        let monitors = endpoints
            .iter()
            .map(|endpoint| {
                let scheduler = scheduler.clone();
                PathMonitor::new(
                    endpoint.remote(),
                    endpoint.counters(),
                    config.monitor_interval,
                    Box::new(move |remote, metrics| {
                        scheduler.update_path_metrics(remote, metrics)
                    }),
                )
            })
            .collect();

        let collector = Arc::new(SmartCollector::new(
            sink,
            config.payload_size,
            config.jitter_window,
            config.flush_interval,
        ));

        info!(
            "engine created: {} path(s), k={} r={}, payload {} bytes, strategy {:?}",
            endpoints.len(),
            config.k,
            config.r,
            config.payload_size,
            config.strategy
        );

        Ok(Engine {
            core: Arc::new(EngineCore {
                payload_size: config.payload_size,
                k: config.k,
                r: config.r,
                strategy: config.strategy,
                scheduler,
                endpoints,
                endpoint_index,
                collector,
                coder,
                undeliverable_chunks: AtomicU64::new(0),
            }),
            monitors,
            source: None,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Configures an internal producer. Must be called before `start`;
    ///  without one, applications call [`Engine::send_frame`] directly.
    pub fn set_frame_source(&mut self, source: Arc<dyn FrameSource>) {
        self.source = Some(source);
    }

    /// Starts all threads. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("engine is already running");
            return;
        }
        info!("engine starting");

        for monitor in &self.monitors {
            monitor.start();
        }
        self.core.collector.start();
        for endpoint in &self.core.endpoints {
            endpoint.start();
        }

        let mut threads = self.threads.lock().unwrap();

        let core = self.core.clone();
        let running = self.running.clone();
        threads.push(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                if !core.dispatch_once() {
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
            debug!("dispatch thread exiting");
        }));

        if let Some(source) = &self.source {
            let source = source.clone();
            let core = self.core.clone();
            let running = self.running.clone();
            threads.push(std::thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match source.next_frame() {
                        Some((frame_id, frame)) => {
                            if let Err(e) = core.send_frame(frame_id, &frame) {
                                warn!("dropping frame {}: {}", frame_id, e);
                            }
                        }
                        None => std::thread::sleep(PRODUCER_IDLE_SLEEP),
                    }
                }
                debug!("producer thread exiting");
            }));
        }

        info!("engine started");
    }

    /// Slices one frame, encodes parity and dispatches every chunk through
    ///  the scheduler. The payload is only read, never mutated.
    pub fn send_frame(&self, frame_id: FrameId, frame: &[u8]) -> Result<(), TransportError> {
        self.core.send_frame(frame_id, frame)
    }

    /// Feeds an RTT measurement for one path (piggybacked timestamp, probe
    ///  response, whatever the deployment derives it from).
    pub fn record_rtt_sample(&self, remote: SocketAddr, rtt_ms: f64) {
        if let Some(monitor) = self.monitors.iter().find(|m| m.remote() == remote) {
            monitor.record_rtt_sample(rtt_ms);
        }
    }

    /// Attributes one lost packet to a path. The endpoint reports kernel
    ///  refusals on its own; losses detected further out (receiver reports,
    ///  probe feedback) come in through here.
    pub fn record_packet_lost(&self, remote: SocketAddr) {
        if let Some(index) = self.core.endpoint_index.get(&remote) {
            self.core.endpoints[*index].counters().record_lost();
        }
    }

    /// Stops all threads in reverse startup order. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("engine stopping");

        // reverse startup order: producer and dispatch threads first, then
        //  endpoint receive threads, the flusher, and finally the monitors
        let mut threads = self.threads.lock().unwrap();
        while let Some(handle) = threads.pop() {
            let _ = handle.join();
        }
        drop(threads);

        for endpoint in &self.core.endpoints {
            endpoint.stop();
        }
        self.core.collector.stop();
        for monitor in &self.monitors {
            monitor.stop();
        }

        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        let active: FxHashMap<SocketAddr, bool> = self
            .core
            .scheduler
            .snapshot()
            .into_iter()
            .map(|status| (status.remote, status.is_active))
            .collect();

        let paths: Vec<PathStats> = self
            .core
            .endpoints
            .iter()
            .map(|endpoint| {
                let counters: Arc<PathCounters> = endpoint.counters();
                PathStats {
                    remote: endpoint.remote(),
                    is_active: active.get(&endpoint.remote()).copied().unwrap_or(false),
                    packets_sent: counters.packets_sent(),
                    packets_received: counters.packets_received(),
                    packets_lost: counters.packets_lost(),
                    send_drops: counters.send_drops(),
                    queue_overflows: counters.queue_overflows(),
                    decode_errors: counters.decode_errors(),
                }
            })
            .collect();
        let decode_errors = paths.iter().map(|p| p.decode_errors).sum();

        EngineStats {
            paths,
            collector: self.core.collector.stats(),
            undeliverable_chunks: self.core.undeliverable_chunks.load(Ordering::Relaxed),
            decode_errors,
        }
    }

    /// Frame ids the collector gave up on (bounded history).
    pub fn recent_dropped_frames(&self) -> Vec<FrameId> {
        self.core.collector.recent_dropped_frames()
    }

    /// The local socket addresses of all endpoints, in path order. Peers
    ///  whose receive filter must admit this engine need these.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>, TransportError> {
        self.core
            .endpoints
            .iter()
            .map(|endpoint| endpoint.local_addr())
            .collect()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
