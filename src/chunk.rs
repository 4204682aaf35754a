use crate::error::TransportError;
use crate::frame_id::FrameId;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the wire header preceding the payload.
pub const HEADER_SIZE: usize = 12;

/// The atomic unit on the wire: exactly one chunk per UDP datagram.
///
/// Header layout, all multi-byte fields little-endian:
/// ```ascii
/// 0:  frame_id (u32)   - producer-assigned, wrap-around
/// 4:  chunk_id (u16)   - 0..k-1 data, k..k+r-1 parity
/// 6:  k (u16)          - data chunk count for this frame
/// 8:  r (u16)          - parity chunk count for this frame
/// 10: chunk_size (u16) - for data chunks: valid bytes inside the payload;
///                        for parity chunks: total frame length in bytes
/// 12: payload          - exactly `payload_size` bytes, zero-padded tail
/// ```
///
/// Carrying `k` and `r` in every chunk keeps the receiver stateless across
///  sender reconfiguration. Parity chunks repurpose `chunk_size` for the
///  frame total because the receiver cannot otherwise trim the reassembled
///  payload exactly when the tail data chunk was lost - the surviving data
///  chunks alone cannot distinguish trailing payload zeros from padding.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Chunk {
    pub frame_id: FrameId,
    pub chunk_id: u16,
    pub k: u16,
    pub r: u16,
    pub chunk_size: u16,
    pub payload: Bytes,
}

impl Chunk {
    /// Constant per configuration: every datagram is exactly this long.
    pub fn wire_size(payload_size: usize) -> usize {
        HEADER_SIZE + payload_size
    }

    pub fn is_parity(&self) -> bool {
        self.chunk_id >= self.k
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.frame_id.to_raw());
        buf.put_u16_le(self.chunk_id);
        buf.put_u16_le(self.k);
        buf.put_u16_le(self.r);
        buf.put_u16_le(self.chunk_size);
        buf.put_slice(&self.payload);
    }

    /// Convenience wrapper producing a freshly allocated wire image.
    pub fn to_datagram(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses one datagram. Rejects short buffers and inconsistent header
    ///  values; a payload section shorter than `payload_size` is zero-padded
    ///  on the right (it must still cover `chunk_size` valid bytes for data
    ///  chunks). The payload buffer is the only allocation.
    pub fn deser(buf: &mut impl Buf, payload_size: usize) -> Result<Chunk, TransportError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(TransportError::Decode(format!(
                "buffer of {} bytes is smaller than the {} byte header",
                buf.remaining(),
                HEADER_SIZE
            )));
        }

        let frame_id = FrameId::from_raw(buf.try_get_u32_le()?);
        let chunk_id = buf.try_get_u16_le()?;
        let k = buf.try_get_u16_le()?;
        let r = buf.try_get_u16_le()?;
        let chunk_size = buf.try_get_u16_le()?;

        if k == 0 {
            return Err(TransportError::Decode("k must be at least 1".to_string()));
        }
        if (chunk_id as u32) >= k as u32 + r as u32 {
            return Err(TransportError::Decode(format!(
                "chunk id {} out of range for k={} r={}",
                chunk_id, k, r
            )));
        }

        let is_data = chunk_id < k;
        let size_limit = if is_data {
            payload_size
        }
        else {
            k as usize * payload_size
        };
        if chunk_size as usize > size_limit {
            return Err(TransportError::Decode(format!(
                "chunk size {} exceeds limit {}",
                chunk_size, size_limit
            )));
        }

        if buf.remaining() > payload_size {
            return Err(TransportError::Decode(format!(
                "payload of {} bytes exceeds configured size {}",
                buf.remaining(),
                payload_size
            )));
        }
        if is_data && buf.remaining() < chunk_size as usize {
            return Err(TransportError::Decode(format!(
                "payload truncated: {} bytes for chunk size {}",
                buf.remaining(),
                chunk_size
            )));
        }

        let mut payload = BytesMut::zeroed(payload_size);
        let received = buf.remaining();
        buf.copy_to_slice(&mut payload[..received]);

        Ok(Chunk {
            frame_id,
            chunk_id,
            k,
            r,
            chunk_size,
            payload: payload.freeze(),
        })
    }
}
