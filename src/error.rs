use std::net::SocketAddr;
use thiserror::Error;

/// The failure modes of the transport core.
///
/// Only configuration and socket-setup failures ever reach the engine's
///  caller; everything else is counted and logged inside the loop where it
///  occurred, and the loop continues.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid configuration - fatal at startup.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Socket creation / bind / connect failed - fatal at startup.
    #[error("socket error on path {path}: {source}")]
    Socket {
        path: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An arriving datagram could not be parsed. The datagram is dropped.
    #[error("undecodable datagram: {0}")]
    Decode(String),

    /// Reconstruction cannot proceed: fewer than K chunks survived.
    #[error("insufficient chunks for reconstruction: {present} present, {needed} needed")]
    InsufficientChunks { present: usize, needed: usize },

    /// The chosen K-subset of surviving chunks produced a degenerate
    ///  decoding matrix and no substitute chunks remain.
    #[error("singular decoding matrix for the surviving chunk subset")]
    SingularMatrix,

    /// A frame payload does not fit into `k` chunks of `payload_size` bytes.
    #[error("frame of {len} bytes does not fit into {k} chunks of {payload_size} bytes")]
    FrameTooLarge {
        len: usize,
        k: u16,
        payload_size: usize,
    },
}

impl From<bytes::TryGetError> for TransportError {
    fn from(e: bytes::TryGetError) -> Self {
        TransportError::Decode(e.to_string())
    }
}
