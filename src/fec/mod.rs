//! Systematic Reed-Solomon erasure coding over GF(2^8).
//!
//! The generator is derived from a Vandermonde matrix: the (k+r) x k matrix
//!  with rows `[1, i, i^2, ...]` is multiplied by the inverse of its top
//!  k x k block, which turns the top into the identity while preserving the
//!  MDS property (any k rows of the result stay invertible). Data chunks
//!  pass through unchanged; the bottom r rows produce the parity chunks.
//!
//! Decoding inverts the k x k submatrix formed by the rows of the surviving
//!  chunks and multiplies the survivors by the inverse to recover exactly
//!  the missing data rows. Everything is deterministic: the same `(k, r)`
//!  produces the same matrices on every machine.

mod gf256;
mod matrix;

use crate::error::TransportError;
use crate::fec::matrix::Matrix;
use tracing::debug;

/// Upper bound on `k + r`: evaluation points must be distinct in GF(2^8).
pub const MAX_TOTAL_CHUNKS: u32 = 256;

pub struct ErasureCoder {
    k: u16,
    r: u16,
    /// r x k parity rows of the systematic generator `[I_k | P]^T`.
    parity: Matrix,
}

impl ErasureCoder {
    pub fn new(k: u16, r: u16) -> Result<ErasureCoder, TransportError> {
        if k == 0 {
            return Err(TransportError::Configuration(
                "k must be at least 1".to_string(),
            ));
        }
        if k as u32 + r as u32 > MAX_TOTAL_CHUNKS {
            return Err(TransportError::Configuration(format!(
                "k + r = {} exceeds the field size limit of {}",
                k as u32 + r as u32,
                MAX_TOTAL_CHUNKS
            )));
        }

        let n = k as usize + r as usize;
        let vandermonde = Matrix::vandermonde(n, k as usize);

        let mut top = Matrix::zero(k as usize, k as usize);
        for i in 0..k as usize {
            top.set_row(i, vandermonde.row(i));
        }
        // distinct evaluation points guarantee the top block is invertible
        let top_inv = top.invert()?;

        let generator = vandermonde.mul(&top_inv);
        let mut parity = Matrix::zero(r as usize, k as usize);
        for i in 0..r as usize {
            parity.set_row(i, generator.row(k as usize + i));
        }

        Ok(ErasureCoder { k, r, parity })
    }

    pub fn k(&self) -> u16 {
        self.k
    }

    pub fn r(&self) -> u16 {
        self.r
    }

    /// Produces the `r` parity buffers for `k` equal-length data buffers.
    pub fn encode(&self, data: &[impl AsRef<[u8]>]) -> Result<Vec<Vec<u8>>, TransportError> {
        if data.len() != self.k as usize {
            return Err(TransportError::Configuration(format!(
                "encode requires exactly {} data buffers, got {}",
                self.k,
                data.len()
            )));
        }
        let len = data[0].as_ref().len();
        if data.iter().any(|d| d.as_ref().len() != len) {
            return Err(TransportError::Configuration(
                "all data buffers must have the same length".to_string(),
            ));
        }

        let mut parity_bufs = vec![vec![0u8; len]; self.r as usize];
        for (j, parity) in parity_bufs.iter_mut().enumerate() {
            for (i, chunk) in data.iter().enumerate() {
                let coefficient = self.parity.get(j, i);
                if coefficient == 0 {
                    continue;
                }
                for (out, &byte) in parity.iter_mut().zip(chunk.as_ref()) {
                    *out = gf256::add(*out, gf256::mul(coefficient, byte));
                }
            }
        }
        Ok(parity_bufs)
    }

    /// Recovers the `k` data buffers from any `k` of the `k + r` chunks.
    ///
    /// `present` holds `(chunk_id, buffer)` pairs in any order; buffers must
    ///  all have the same length. Returns the data buffers in chunk-id order.
    pub fn decode(&self, present: &[(u16, &[u8])]) -> Result<Vec<Vec<u8>>, TransportError> {
        let k = self.k as usize;
        if present.len() < k {
            return Err(TransportError::InsufficientChunks {
                present: present.len(),
                needed: k,
            });
        }
        let len = present[0].1.len();
        if present.iter().any(|(_, buf)| buf.len() != len) {
            return Err(TransportError::Configuration(
                "all chunk buffers must have the same length".to_string(),
            ));
        }

        let mut candidates: Vec<usize> = (0..present.len()).collect();
        candidates.sort_by_key(|&i| present[i].0);

        // fast path: every data chunk survived
        let data_present = candidates
            .iter()
            .filter(|&&i| present[i].0 < self.k)
            .count();
        if data_present == k {
            let mut data = vec![Vec::new(); k];
            for &i in &candidates {
                let (chunk_id, buf) = present[i];
                if chunk_id < self.k {
                    data[chunk_id as usize] = buf.to_vec();
                }
            }
            return Ok(data);
        }

        // data rows are unit rows and always part of the selection; parity
        //  rows fill the remainder, with unused survivors as substitutes if
        //  a subset turns out degenerate
        let mut selection: Vec<usize> = candidates[..k].to_vec();
        let mut next_substitute = k;
        let inverse = loop {
            let mut sub = Matrix::zero(k, k);
            for (row, &i) in selection.iter().enumerate() {
                sub.set_row(row, &self.generator_row(present[i].0));
            }
            match sub.invert() {
                Ok(inverse) => break inverse,
                Err(TransportError::SingularMatrix) if next_substitute < candidates.len() => {
                    debug!(
                        "degenerate chunk subset, substituting survivor {}",
                        present[candidates[next_substitute]].0
                    );
                    let last = selection.len() - 1;
                    selection[last] = candidates[next_substitute];
                    next_substitute += 1;
                }
                Err(_) => return Err(TransportError::SingularMatrix),
            }
        };

        let mut data: Vec<Vec<u8>> = vec![Vec::new(); k];
        for &i in &selection {
            let (chunk_id, buf) = present[i];
            if chunk_id < self.k {
                data[chunk_id as usize] = buf.to_vec();
            }
        }
        for row in 0..k {
            if !data[row].is_empty() || !self.row_is_missing(row, &selection, present) {
                continue;
            }
            let mut recovered = vec![0u8; len];
            for (col, &i) in selection.iter().enumerate() {
                let coefficient = inverse.get(row, col);
                if coefficient == 0 {
                    continue;
                }
                for (out, &byte) in recovered.iter_mut().zip(present[i].1) {
                    *out = gf256::add(*out, gf256::mul(coefficient, byte));
                }
            }
            data[row] = recovered;
        }
        Ok(data)
    }

    /// Row of the systematic generator for one chunk id: a unit row for data
    ///  chunks, a parity row otherwise.
    fn generator_row(&self, chunk_id: u16) -> Vec<u8> {
        let k = self.k as usize;
        if (chunk_id as usize) < k {
            let mut row = vec![0u8; k];
            row[chunk_id as usize] = 1;
            row
        }
        else {
            self.parity.row(chunk_id as usize - k).to_vec()
        }
    }

    fn row_is_missing(&self, row: usize, selection: &[usize], present: &[(u16, &[u8])]) -> bool {
        !selection.iter().any(|&i| present[i].0 as usize == row)
    }
}
