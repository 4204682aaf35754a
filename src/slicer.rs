//! Cuts a frame payload into `k` fixed-size data chunks and reassembles it.
//!
//! Every chunk carries exactly `payload_size` payload bytes on the wire;
//!  the frame is filled in sequentially, so chunk `i` holds bytes
//!  `[i * payload_size, (i + 1) * payload_size)` with the tail zero-padded.
//!  Uniform chunk size is what makes the systematic erasure code work:
//!  parity is computed position-by-position across equal-length buffers.

use crate::chunk::Chunk;
use crate::error::TransportError;
use crate::frame_id::FrameId;
use bytes::{Bytes, BytesMut};

/// Produces the `k` data chunks for one frame. An empty frame yields `k`
///  zero-padded chunks with `chunk_size = 0`; a frame longer than
///  `k * payload_size` cannot be represented and is rejected.
pub fn slice(
    frame: &[u8],
    frame_id: FrameId,
    k: u16,
    r: u16,
    payload_size: usize,
) -> Result<Vec<Chunk>, TransportError> {
    if frame.len() > k as usize * payload_size {
        return Err(TransportError::FrameTooLarge {
            len: frame.len(),
            k,
            payload_size,
        });
    }

    let mut chunks = Vec::with_capacity(k as usize);
    for i in 0..k as usize {
        let start = usize::min(i * payload_size, frame.len());
        let end = usize::min(start + payload_size, frame.len());

        let mut payload = BytesMut::zeroed(payload_size);
        payload[..end - start].copy_from_slice(&frame[start..end]);

        chunks.push(Chunk {
            frame_id,
            chunk_id: i as u16,
            k,
            r,
            chunk_size: (end - start) as u16,
            payload: payload.freeze(),
        });
    }
    Ok(chunks)
}

/// Reassembles the original frame payload from the data chunks, which must
///  be complete and in `chunk_id` order.
pub fn unslice(chunks: &[Chunk]) -> Bytes {
    let total: usize = chunks.iter().map(|c| c.chunk_size as usize).sum();
    let mut frame = BytesMut::with_capacity(total);
    for chunk in chunks {
        frame.extend_from_slice(&chunk.payload[..chunk.chunk_size as usize]);
    }
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[rstest]
    #[case::empty(0, 4, 100)]
    #[case::one_byte(1, 4, 100)]
    #[case::below_one_chunk(99, 4, 100)]
    #[case::exactly_one_chunk(100, 4, 100)]
    #[case::one_chunk_plus_one(101, 4, 100)]
    #[case::partial_last(350, 4, 100)]
    #[case::full(400, 4, 100)]
    #[case::single_chunk_config(64, 1, 100)]
    #[case::default_parameters(7321, 8, 1000)]
    fn test_slice_unslice_round_trip(
        #[case] len: usize,
        #[case] k: u16,
        #[case] payload_size: usize,
    ) {
        let frame = pattern(len);
        let chunks = slice(&frame, FrameId::from_raw(42), k, 2, payload_size).unwrap();

        assert_eq!(chunks.len(), k as usize);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_id, i as u16);
            assert_eq!(chunk.k, k);
            assert_eq!(chunk.r, 2);
            assert_eq!(chunk.payload.len(), payload_size);
        }
        let total: usize = chunks.iter().map(|c| c.chunk_size as usize).sum();
        assert_eq!(total, len);

        assert_eq!(unslice(&chunks).as_ref(), &frame[..]);
    }

    #[test]
    fn test_slice_pads_with_zeros() {
        let chunks = slice(&[0xffu8; 150], FrameId::ZERO, 4, 2, 100).unwrap();
        assert_eq!(chunks[1].chunk_size, 50);
        assert!(chunks[1].payload[50..].iter().all(|&b| b == 0));
        assert_eq!(chunks[2].chunk_size, 0);
        assert!(chunks[2].payload.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_slice_rejects_oversized_frame() {
        let result = slice(&pattern(401), FrameId::ZERO, 4, 2, 100);
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
    }
}
