//! Per-path metrics computation.
//!
//! Each monitor owns a thread that wakes on a fixed interval, derives the
//!  path's loss rate from the shared counters, folds any pending RTT sample
//!  into an exponential moving average, and publishes the result through an
//!  injected sink. The sink is a bare callable rather than a scheduler
//!  reference, so the monitor and the scheduler share no cycle.
//!
//! The monitor does not decide liveness - the scheduler does, from the
//!  published loss rates.

use crate::path::{PathCounters, PathMetrics};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Where monitors publish their periodic updates.
pub type MetricsSink = Box<dyn Fn(SocketAddr, PathMetrics) + Send + Sync>;

/// Smoothing factor of the RTT moving average:
///  `new = alpha * sample + (1 - alpha) * old`.
const RTT_ALPHA: f64 = 0.1;

/// Bandwidth estimate used while no measurement exists. Kept in the
///  published metrics for forward-compatibility of the weighted strategies.
const DEFAULT_BANDWIDTH_MBPS: f64 = 10.0;

/// Granularity of the monitor thread's shutdown checks.
const TICK: Duration = Duration::from_millis(10);

struct MonitorState {
    rtt_ms: f64,
    pending_rtt_sample: Option<f64>,
    bandwidth_mbps: f64,
}

pub struct PathMonitor {
    remote: SocketAddr,
    counters: Arc<PathCounters>,
    state: Arc<Mutex<MonitorState>>,
    sink: Arc<MetricsSink>,
    interval: Duration,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PathMonitor {
    pub fn new(
        remote: SocketAddr,
        counters: Arc<PathCounters>,
        interval: Duration,
        sink: MetricsSink,
    ) -> PathMonitor {
        PathMonitor {
            remote,
            counters,
            state: Arc::new(Mutex::new(MonitorState {
                rtt_ms: 0.0,
                pending_rtt_sample: None,
                bandwidth_mbps: DEFAULT_BANDWIDTH_MBPS,
            })),
            sink: Arc::new(sink),
            interval,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Feeds one RTT measurement. The sample source is pluggable - a
    ///  piggybacked timestamp, a dedicated probe, whatever the deployment
    ///  has; the monitor only fixes the smoothing.
    pub fn record_rtt_sample(&self, rtt_ms: f64) {
        self.state.lock().unwrap().pending_rtt_sample = Some(rtt_ms);
    }

    /// Computes and publishes one metrics update immediately.
    pub fn publish_now(&self) {
        let metrics = Self::compute(&self.state, &self.counters);
        debug!("metrics for {:?}: {:?}", self.remote, metrics);
        (*self.sink)(self.remote, metrics);
    }

    fn compute(state: &Mutex<MonitorState>, counters: &PathCounters) -> PathMetrics {
        let sent = counters.packets_sent();
        let received = counters.packets_received();
        let lost = counters.packets_lost();
        let loss_rate = lost as f64 / u64::max(1, sent + received) as f64;

        let mut state = state.lock().unwrap();
        if let Some(sample) = state.pending_rtt_sample.take() {
            state.rtt_ms = RTT_ALPHA * sample + (1.0 - RTT_ALPHA) * state.rtt_ms;
        }

        PathMetrics {
            rtt_ms: state.rtt_ms,
            loss_rate: f64::min(loss_rate, 1.0),
            bandwidth_mbps: state.bandwidth_mbps,
        }
    }

    /// Starts the metrics thread. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("monitor for {:?} is already running", self.remote);
            return;
        }

        let remote = self.remote;
        let counters = self.counters.clone();
        let state = self.state.clone();
        let sink = self.sink.clone();
        let interval = self.interval;
        let running = self.running.clone();

        let handle = std::thread::spawn(move || {
            let mut last_update = Instant::now();
            while running.load(Ordering::Relaxed) {
                if last_update.elapsed() >= interval {
                    let metrics = Self::compute(&state, &counters);
                    debug!("metrics for {:?}: {:?}", remote, metrics);
                    (*sink)(remote, metrics);
                    last_update = Instant::now();
                }
                std::thread::sleep(TICK);
            }
            debug!("monitor thread for {:?} exiting", remote);
        });
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Signals the metrics thread and joins it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PathMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_sink() -> (MetricsSink, Arc<Mutex<Vec<PathMetrics>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();
        let sink: MetricsSink = Box::new(move |_, metrics| {
            captured_clone.lock().unwrap().push(metrics);
        });
        (sink, captured)
    }

    fn monitor(counters: Arc<PathCounters>) -> (PathMonitor, Arc<Mutex<Vec<PathMetrics>>>) {
        let (sink, captured) = capture_sink();
        let monitor = PathMonitor::new(
            "127.0.0.1:9000".parse().unwrap(),
            counters,
            Duration::from_secs(1),
            sink,
        );
        (monitor, captured)
    }

    #[test]
    fn test_loss_rate_from_counters() {
        let counters = Arc::new(PathCounters::default());
        for _ in 0..8 {
            counters.record_sent();
        }
        for _ in 0..2 {
            counters.record_lost();
        }

        let (monitor, captured) = monitor(counters);
        monitor.publish_now();

        let published = captured.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert!((published[0].loss_rate - 0.25).abs() < 1e-9);
        assert_eq!(published[0].bandwidth_mbps, DEFAULT_BANDWIDTH_MBPS);
    }

    #[test]
    fn test_loss_rate_without_traffic_is_zero() {
        let (monitor, captured) = monitor(Arc::new(PathCounters::default()));
        monitor.publish_now();

        assert_eq!(captured.lock().unwrap()[0].loss_rate, 0.0);
    }

    #[test]
    fn test_rtt_ema() {
        let (monitor, captured) = monitor(Arc::new(PathCounters::default()));

        monitor.record_rtt_sample(100.0);
        monitor.publish_now();
        // sample folds in once, then the average holds without new samples
        monitor.publish_now();
        monitor.record_rtt_sample(100.0);
        monitor.publish_now();

        let published = captured.lock().unwrap();
        assert!((published[0].rtt_ms - 10.0).abs() < 1e-9);
        assert!((published[1].rtt_ms - 10.0).abs() < 1e-9);
        assert!((published[2].rtt_ms - 19.0).abs() < 1e-9);
    }
}
