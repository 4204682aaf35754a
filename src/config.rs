use crate::error::TransportError;
use crate::path::PathConfig;
use crate::scheduler::Strategy;
use std::time::Duration;

/// Largest UDP payload that fits a single unfragmented IPv4 datagram in
///  theory. The real bound is the path MTU, which is the deployer's problem
///  to know - the configuration only rejects what can never work.
const MAX_UDP_PAYLOAD: usize = 65_507;

pub const DEFAULT_PAYLOAD_SIZE: usize = 1000;
pub const DEFAULT_K: u16 = 8;
pub const DEFAULT_R: u16 = 2;
pub const DEFAULT_JITTER_WINDOW: Duration = Duration::from_millis(50);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(25);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RECEIVE_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_RECEIVE_POLL_CAP: usize = 64;

pub struct EngineConfig {
    /// Fixed payload byte count per chunk. Every datagram is exactly
    ///  `12 + payload_size` bytes; it is the application's responsibility
    ///  to choose a value that fits the effective path MTU on all routes.
    pub payload_size: usize,

    /// Data chunks per frame. A frame must fit into `k * payload_size`
    ///  bytes, and that product must be representable in the 16-bit frame
    ///  total that parity chunks carry.
    pub k: u16,

    /// Parity chunks per frame. Up to `r` lost chunks per frame are
    ///  recoverable.
    pub r: u16,

    /// How long the collector waits for the chunks of a frame (and for
    ///  in-order emission gaps) before giving up.
    pub jitter_window: Duration,

    /// Period of the collector's flusher thread.
    pub flush_interval: Duration,

    /// Period of the per-path metrics computation.
    pub monitor_interval: Duration,

    /// The remote endpoints used as parallel paths, in insertion order.
    pub paths: Vec<PathConfig>,

    /// Path selection strategy for outgoing chunks.
    pub strategy: Strategy,

    /// Bound of each endpoint's receive queue; on overflow the oldest
    ///  datagram is evicted.
    pub receive_queue_capacity: usize,

    /// Maximum datagrams handed out per `poll_receive` call, so one busy
    ///  path cannot starve the others in the dispatch loop.
    pub receive_poll_cap: usize,

    // Pass-through for the external encoder; the core does not interpret
    //  these.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

impl EngineConfig {
    /// Configuration with the documented defaults for the given paths.
    pub fn new(paths: Vec<PathConfig>) -> EngineConfig {
        EngineConfig {
            payload_size: DEFAULT_PAYLOAD_SIZE,
            k: DEFAULT_K,
            r: DEFAULT_R,
            jitter_window: DEFAULT_JITTER_WINDOW,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            paths,
            strategy: Strategy::default(),
            receive_queue_capacity: DEFAULT_RECEIVE_QUEUE_CAPACITY,
            receive_poll_cap: DEFAULT_RECEIVE_POLL_CAP,
            width: 640,
            height: 480,
            fps: 30,
            bitrate_kbps: 2000,
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        fn fail(msg: String) -> Result<(), TransportError> {
            Err(TransportError::Configuration(msg))
        }

        if self.payload_size == 0 {
            return fail("payload_size must be at least 1".to_string());
        }
        if crate::chunk::HEADER_SIZE + self.payload_size > MAX_UDP_PAYLOAD {
            return fail(format!(
                "datagram size {} exceeds the UDP limit of {}",
                crate::chunk::HEADER_SIZE + self.payload_size,
                MAX_UDP_PAYLOAD
            ));
        }
        if self.k == 0 {
            return fail("k must be at least 1".to_string());
        }
        if self.k as u32 + self.r as u32 > crate::fec::MAX_TOTAL_CHUNKS {
            return fail(format!(
                "k + r = {} exceeds {}",
                self.k as u32 + self.r as u32,
                crate::fec::MAX_TOTAL_CHUNKS
            ));
        }
        if self.k as usize * self.payload_size > u16::MAX as usize {
            return fail(format!(
                "k * payload_size = {} exceeds the 16-bit frame total limit of {}",
                self.k as usize * self.payload_size,
                u16::MAX
            ));
        }
        if self.paths.is_empty() {
            return fail("at least one path is required".to_string());
        }
        for (i, path) in self.paths.iter().enumerate() {
            if self.paths[..i].iter().any(|p| p.remote == path.remote) {
                return fail(format!("duplicate path remote {:?}", path.remote));
            }
        }
        if self.jitter_window.is_zero() {
            return fail("jitter_window must be positive".to_string());
        }
        if self.flush_interval.is_zero() {
            return fail("flush_interval must be positive".to_string());
        }
        if self.monitor_interval.is_zero() {
            return fail("monitor_interval must be positive".to_string());
        }
        if self.receive_queue_capacity == 0 {
            return fail("receive_queue_capacity must be at least 1".to_string());
        }
        if self.receive_poll_cap == 0 {
            return fail("receive_poll_cap must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig::new(vec![PathConfig::new("127.0.0.1:9000".parse().unwrap())])
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_paths() {
        let config = EngineConfig::new(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_remotes() {
        let remote = "127.0.0.1:9000".parse().unwrap();
        let config = EngineConfig::new(vec![PathConfig::new(remote), PathConfig::new(remote)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_k() {
        let mut config = valid();
        config.k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_field_overflow() {
        let mut config = valid();
        config.k = 200;
        config.r = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unrepresentable_frame_total() {
        let mut config = valid();
        config.k = 66;
        config.payload_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_datagram() {
        let mut config = valid();
        config.k = 1;
        config.payload_size = 65_500;
        assert!(config.validate().is_err());
    }
}
