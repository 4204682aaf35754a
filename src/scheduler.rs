//! Owns the path set and its current metrics, and picks a path for every
//!  outgoing chunk.
//!
//! All state lives behind one mutex that is held only for the O(paths)
//!  selection or update work, so strategies are safe to call concurrently
//!  with metric updates. Liveness is decided here, not in the monitors: a
//!  path whose published loss rate stays at or above [`INACTIVE_LOSS_RATE`]
//!  for [`INACTIVE_INTERVALS`] consecutive updates is taken out of the
//!  rotation, and a single successful receive puts it back.

use crate::path::PathMetrics;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

const INACTIVE_LOSS_RATE: f64 = 0.9;
const INACTIVE_INTERVALS: u32 = 3;

/// Path selection strategies for outgoing chunks.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Strategy {
    /// Walk the active paths in insertion order.
    RoundRobin,
    /// Sample proportionally to `1/(rtt+1) * (1-loss) * (1 + bandwidth/100)`.
    WeightedRoundRobin,
    /// Minimum RTT; ties by loss, then insertion order.
    LowestRtt,
    /// Minimum loss; ties by RTT, then insertion order.
    LowestLoss,
    /// Minimize `rtt * (1 + 10 * loss)` - loss costs an order of magnitude
    ///  more than raw latency, which keeps selection smooth under drift.
    #[default]
    Adaptive,
}

/// Externally visible state of one path.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PathStatus {
    pub remote: SocketAddr,
    pub metrics: PathMetrics,
    pub is_active: bool,
}

struct PathEntry {
    remote: SocketAddr,
    metrics: PathMetrics,
    is_active: bool,
    lossy_intervals: u32,
}

struct SchedulerInner {
    /// Insertion order is part of the contract: round-robin walks it, and
    ///  ties everywhere else resolve to the earliest entry.
    paths: Vec<PathEntry>,
    round_robin_cursor: usize,
}

pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            inner: Mutex::new(SchedulerInner {
                paths: Vec::new(),
                round_robin_cursor: 0,
            }),
        }
    }

    /// Adds a path. Idempotent on the remote address.
    pub fn add_path(&self, remote: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if inner.paths.iter().any(|p| p.remote == remote) {
            return;
        }
        debug!("adding path {:?}", remote);
        inner.paths.push(PathEntry {
            remote,
            metrics: PathMetrics::default(),
            is_active: true,
            lossy_intervals: 0,
        });
    }

    /// Removes a path. Idempotent on the remote address.
    pub fn remove_path(&self, remote: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.paths.retain(|p| p.remote != remote);
        inner.round_robin_cursor = 0;
    }

    /// Applies a monitor update and re-evaluates liveness.
    pub fn update_path_metrics(&self, remote: SocketAddr, metrics: PathMetrics) {
        let mut inner = self.inner.lock().unwrap();
        let entry = match inner.paths.iter_mut().find(|p| p.remote == remote) {
            Some(entry) => entry,
            None => return,
        };

        entry.metrics = metrics;
        if metrics.loss_rate >= INACTIVE_LOSS_RATE {
            entry.lossy_intervals += 1;
            if entry.lossy_intervals >= INACTIVE_INTERVALS && entry.is_active {
                warn!(
                    "path {:?} lossy for {} consecutive intervals, deactivating",
                    remote, entry.lossy_intervals
                );
                entry.is_active = false;
            }
        }
        else {
            entry.lossy_intervals = 0;
        }
    }

    /// A successful receive proves the path is alive again.
    pub fn record_receive(&self, remote: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.paths.iter_mut().find(|p| p.remote == remote) {
            if !entry.is_active {
                info!("path {:?} received traffic, reactivating", remote);
                entry.is_active = true;
            }
            entry.lossy_intervals = 0;
        }
    }

    /// Picks the path for the next outgoing chunk, or `None` if no path is
    ///  active.
    pub fn get_next_path(&self, strategy: Strategy) -> Option<SocketAddr> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.paths.iter().any(|p| p.is_active) {
            return None;
        }

        match strategy {
            Strategy::RoundRobin => inner.round_robin(),
            Strategy::WeightedRoundRobin => inner.weighted_round_robin(),
            Strategy::LowestRtt => inner.best_by(|m| (m.rtt_ms, m.loss_rate)),
            Strategy::LowestLoss => inner.best_by(|m| (m.loss_rate, m.rtt_ms)),
            Strategy::Adaptive => inner.best_by(|m| (m.rtt_ms * (1.0 + 10.0 * m.loss_rate), 0.0)),
        }
    }

    pub fn path_count(&self) -> usize {
        self.inner.lock().unwrap().paths.len()
    }

    pub fn has_active_paths(&self) -> bool {
        self.inner.lock().unwrap().paths.iter().any(|p| p.is_active)
    }

    pub fn snapshot(&self) -> Vec<PathStatus> {
        self.inner
            .lock()
            .unwrap()
            .paths
            .iter()
            .map(|p| PathStatus {
                remote: p.remote,
                metrics: p.metrics,
                is_active: p.is_active,
            })
            .collect()
    }
}

impl SchedulerInner {
    fn round_robin(&mut self) -> Option<SocketAddr> {
        let len = self.paths.len();
        for _ in 0..len {
            let index = self.round_robin_cursor % len;
            self.round_robin_cursor = self.round_robin_cursor.wrapping_add(1);
            if self.paths[index].is_active {
                return Some(self.paths[index].remote);
            }
        }
        None
    }

    fn weighted_round_robin(&self) -> Option<SocketAddr> {
        let active: Vec<&PathEntry> = self.paths.iter().filter(|p| p.is_active).collect();
        let weights: Vec<f64> = active.iter().map(|p| Self::weight(&p.metrics)).collect();

        match WeightedIndex::new(&weights) {
            Ok(distribution) => {
                let index = distribution.sample(&mut rand::thread_rng());
                Some(active[index].remote)
            }
            // all weights zero: no basis for preference, fall back to the
            //  earliest active path
            Err(_) => active.first().map(|p| p.remote),
        }
    }

    fn weight(metrics: &PathMetrics) -> f64 {
        let rtt_weight = 1.0 / (metrics.rtt_ms + 1.0);
        let loss_weight = 1.0 - metrics.loss_rate;
        let bandwidth_weight = 1.0 + metrics.bandwidth_mbps / 100.0;
        rtt_weight * loss_weight * bandwidth_weight
    }

    /// Minimum of `score` over the active paths; strict comparison keeps
    ///  the earliest entry on ties.
    fn best_by(&self, score: impl Fn(&PathMetrics) -> (f64, f64)) -> Option<SocketAddr> {
        let mut best: Option<(&PathEntry, (f64, f64))> = None;
        for entry in self.paths.iter().filter(|p| p.is_active) {
            let entry_score = score(&entry.metrics);
            match &best {
                Some((_, best_score))
                    if entry_score.0 > best_score.0
                        || (entry_score.0 == best_score.0 && entry_score.1 >= best_score.1) => {}
                _ => best = Some((entry, entry_score)),
            }
        }
        best.map(|(entry, _)| entry.remote)
    }
}
