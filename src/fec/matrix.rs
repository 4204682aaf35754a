//! Dense row-major matrices over GF(2^8), just enough linear algebra for a
//!  systematic Reed-Solomon code: Vandermonde construction, multiplication
//!  and Gauss-Jordan inversion.

use crate::error::TransportError;
use crate::fec::gf256;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zero(rows: usize, cols: usize) -> Matrix {
        Matrix {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Matrix {
        let mut m = Matrix::zero(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    /// The (rows x cols) Vandermonde matrix with evaluation points
    ///  `0, 1, ..., rows - 1`: row `i` is `[1, i, i^2, ...]`.
    ///  Any `cols` rows are linearly independent as long as `rows <= 256`
    ///  (distinct evaluation points in GF(2^8)).
    pub fn vandermonde(rows: usize, cols: usize) -> Matrix {
        let mut m = Matrix::zero(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                m.set(i, j, gf256::pow(i as u8, j));
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[u8] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn set_row(&mut self, row: usize, values: &[u8]) {
        self.data[row * self.cols..(row + 1) * self.cols].copy_from_slice(values);
    }

    pub fn mul(&self, other: &Matrix) -> Matrix {
        assert_eq!(self.cols, other.rows);

        let mut result = Matrix::zero(self.rows, other.cols);
        for i in 0..self.rows {
            for j in 0..other.cols {
                let mut acc = 0u8;
                for l in 0..self.cols {
                    acc = gf256::add(acc, gf256::mul(self.get(i, l), other.get(l, j)));
                }
                result.set(i, j, acc);
            }
        }
        result
    }

    /// Gauss-Jordan inversion. Returns `SingularMatrix` if no pivot can be
    ///  found for some column.
    pub fn invert(&self) -> Result<Matrix, TransportError> {
        assert_eq!(self.rows, self.cols);
        let n = self.rows;

        let mut work = self.clone();
        let mut inverse = Matrix::identity(n);

        for col in 0..n {
            // find a pivot row at or below the diagonal
            let pivot_row = (col..n).find(|&row| work.get(row, col) != 0);
            let pivot_row = match pivot_row {
                Some(row) => row,
                None => return Err(TransportError::SingularMatrix),
            };
            if pivot_row != col {
                work.swap_rows(pivot_row, col);
                inverse.swap_rows(pivot_row, col);
            }

            let pivot_inv = gf256::inv(work.get(col, col));
            work.scale_row(col, pivot_inv);
            inverse.scale_row(col, pivot_inv);

            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = work.get(row, col);
                if factor != 0 {
                    work.add_scaled_row(row, col, factor);
                    inverse.add_scaled_row(row, col, factor);
                }
            }
        }
        Ok(inverse)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for col in 0..self.cols {
            let tmp = self.get(a, col);
            self.set(a, col, self.get(b, col));
            self.set(b, col, tmp);
        }
    }

    fn scale_row(&mut self, row: usize, factor: u8) {
        for col in 0..self.cols {
            self.set(row, col, gf256::mul(self.get(row, col), factor));
        }
    }

    /// `row[target] += factor * row[source]` (addition is xor).
    fn add_scaled_row(&mut self, target: usize, source: usize, factor: u8) {
        for col in 0..self.cols {
            let value = gf256::add(
                self.get(target, col),
                gf256::mul(self.get(source, col), factor),
            );
            self.set(target, col, value);
        }
    }
}
