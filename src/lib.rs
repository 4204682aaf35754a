//! A real-time multipath UDP transport for loss-tolerant media streams.
//!
//! A sender fragments each opaque frame payload into fixed-size data
//!  chunks, adds forward-error-correction parity chunks, and sprays them
//!  across several parallel UDP paths (distinct remote endpoints). The
//!  receiver reassembles frames from whatever arrives within a bounded
//!  jitter window, recovering lost chunks through the erasure code when
//!  possible. Every path is continuously measured (RTT, loss, bandwidth),
//!  and a scheduler steers traffic toward the paths that currently perform
//!  best.
//!
//! ## Design goals
//!
//! * Latency beats completeness: there is no retransmission and no
//!   acknowledgement. A frame that cannot be completed within the jitter
//!   window is dropped, and the stream moves on - the payloads are encoded
//!   media where a fresh frame is worth more than an old one.
//! * Loss tolerance through redundancy instead of feedback: a systematic
//!   Reed-Solomon code over GF(2^8) turns K data chunks into K+R chunks of
//!   which any K reconstruct the frame.
//! * Per-chunk path selection: chunks of one frame spread over all usable
//!   paths, so a failing path costs at most what the parity can absorb,
//!   not whole frames.
//! * Delivery is 'in-order enough': frames are emitted in ascending frame
//!   id, but a missing frame stalls its successors for at most the jitter
//!   window before being skipped.
//! * Plain threads and non-blocking sockets - suspension points are OS
//!   I/O and sleeps, there is no user-space task scheduler to integrate
//!   with.
//!
//! ## Wire format
//!
//! Each UDP datagram carries exactly one chunk. All multi-byte fields are
//!  little-endian, serialized explicitly (never by raw memory copy):
//!
//! ```ascii
//! 0:  frame_id (u32)   - producer-assigned, wrap-around with a 2^31
//!      comparison window
//! 4:  chunk_id (u16)   - 0..k-1 data chunks, k..k+r-1 parity chunks
//! 6:  k (u16)          - data chunk count of this frame
//! 8:  r (u16)          - parity chunk count of this frame
//! 10: chunk_size (u16) - data chunks: valid byte count inside the payload;
//!      parity chunks: total frame length in bytes, so the receiver can
//!      trim a reconstruction exactly even when the tail data chunk is lost
//! 12: payload          - exactly `payload_size` bytes, zero-padded
//! ```
//!
//! Every chunk carries `k` and `r`, which keeps the receiver stateless
//!  across sender reconfiguration. The datagram size is constant per
//!  configuration (`12 + payload_size` bytes) and must fit the effective
//!  path MTU - the configuration does not try to discover or guess it.
//!
//! ## Components
//!
//! * [`chunk`] - the wire codec.
//! * [`slicer`] - frame payload to K fixed-size data chunks and back.
//! * [`fec`] - the systematic Reed-Solomon erasure coder.
//! * [`endpoint`] - one non-blocking UDP socket per path with a receive
//!   thread and a bounded drop-oldest queue.
//! * [`monitor`] - per-path metrics (loss rate from shared counters, RTT
//!   as an exponential moving average over injected samples).
//! * [`scheduler`] - path set, liveness and the five selection strategies.
//! * [`collector`] - jitter-buffered reassembly, FEC recovery and in-order
//!   emission.
//! * [`engine`] - wires everything together behind start/stop.
//!
//! ## Related
//!
//! * SRT / RIST - the same jitter-buffer idea, but leaning on
//!   retransmission (ARQ) rather than pure FEC
//! * QUIC datagrams - unreliable delivery over one path with connection
//!   migration, not concurrent multipath spraying
//! * MPTCP - multipath with full reliability and ordering, the opposite
//!   trade-off of this transport

pub mod chunk;
pub mod collector;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod fec;
pub mod frame_id;
pub mod monitor;
pub mod path;
pub mod scheduler;
pub mod slicer;

pub use chunk::Chunk;
pub use collector::{CollectorStats, FrameSink, SmartCollector};
pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, FrameSource, PathStats};
pub use error::TransportError;
pub use fec::ErasureCoder;
pub use frame_id::FrameId;
pub use monitor::PathMonitor;
pub use path::{PathConfig, PathMetrics};
pub use scheduler::{Scheduler, Strategy};
