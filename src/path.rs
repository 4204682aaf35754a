use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// One UDP path: the remote peer endpoint, plus an optional local bind
///  address.
///
/// By default the socket binds a wildcard address with an OS-chosen
///  ephemeral port. Deployments where both peers address each other
///  directly (no relay, no port negotiation) bind a known local port on
///  both sides instead, so each side can list the other as `remote`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PathConfig {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl PathConfig {
    pub fn new(remote: SocketAddr) -> PathConfig {
        PathConfig {
            remote,
            local: None,
        }
    }

    pub fn with_local(remote: SocketAddr, local: SocketAddr) -> PathConfig {
        PathConfig {
            remote,
            local: Some(local),
        }
    }
}

impl From<SocketAddr> for PathConfig {
    fn from(remote: SocketAddr) -> Self {
        PathConfig::new(remote)
    }
}

/// Snapshot of a path's quality metrics, as published by its monitor.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PathMetrics {
    pub rtt_ms: f64,
    /// In `[0, 1]`.
    pub loss_rate: f64,
    pub bandwidth_mbps: f64,
}

impl Default for PathMetrics {
    fn default() -> Self {
        PathMetrics {
            rtt_ms: 0.0,
            loss_rate: 0.0,
            bandwidth_mbps: 0.0,
        }
    }
}

/// Per-path counters, shared lock-free between the endpoint (writer), the
///  monitor (reader) and engine statistics (reader).
#[derive(Default, Debug)]
pub struct PathCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_lost: AtomicU64,
    send_drops: AtomicU64,
    queue_overflows: AtomicU64,
    decode_errors: AtomicU64,
}

impl PathCounters {
    pub fn record_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.packets_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_drop(&self) {
        self.send_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_overflow(&self) {
        self.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost.load(Ordering::Relaxed)
    }

    pub fn send_drops(&self) -> u64 {
        self.send_drops.load(Ordering::Relaxed)
    }

    pub fn queue_overflows(&self) -> u64 {
        self.queue_overflows.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}
