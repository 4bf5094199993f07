//! Tensors with elementwise arithmetic in the ring of integers modulo `q`.
//!
//! All protocol values (shares, masks, triples) are [`RingTensor`]s: dense,
//! dynamic-shape tensors of `u64` residues together with the ring modulus they
//! live in. Arithmetic uses `u128` intermediates, so any modulus below `2^64`
//! is supported without overflow.

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by ring tensor arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    /// The operands of an elementwise operation have different shapes.
    #[error("shape mismatch: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// Shape of the left operand.
        lhs: Vec<usize>,
        /// Shape of the right operand.
        rhs: Vec<usize>,
    },
    /// The operands live in different rings.
    #[error("modulus mismatch: {lhs} vs {rhs}")]
    ModulusMismatch {
        /// Modulus of the left operand.
        lhs: u64,
        /// Modulus of the right operand.
        rhs: u64,
    },
    /// The leading axes of the contraction operands do not agree.
    #[error("cannot contract {lhs:?} with {rhs:?} along the leading axis")]
    ContractionMismatch {
        /// Shape of the left operand.
        lhs: Vec<usize>,
        /// Shape of the right operand.
        rhs: Vec<usize>,
    },
    /// Reduction modulo zero.
    #[error("modulus must be non-zero")]
    ZeroModulus,
}

/// A dense tensor of residues modulo a fixed ring modulus `q < 2^64`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingTensor {
    values: ArrayD<u64>,
    q: u64,
}

impl RingTensor {
    /// Wraps raw values in the ring, reducing each element modulo `q`.
    pub fn new(values: ArrayD<u64>, q: u64) -> Self {
        let values = values.mapv(|v| v % q);
        RingTensor { values, q }
    }

    /// An all-zero tensor of the given shape.
    pub fn zeros(shape: &[usize], q: u64) -> Self {
        RingTensor {
            values: ArrayD::zeros(IxDyn(shape)),
            q,
        }
    }

    /// A fresh uniformly random tensor, used for shares, masks and triples.
    pub fn uniform(shape: &[usize], q: u64, rng: &mut impl Rng) -> Self {
        let len: usize = shape.iter().product();
        let values: Vec<u64> = (0..len).map(|_| rng.random_range(0..q)).collect();
        let values = ArrayD::from_shape_vec(IxDyn(shape), values)
            .expect("length is the product of the shape");
        RingTensor { values, q }
    }

    /// The ring modulus.
    pub fn modulus(&self) -> u64 {
        self.q
    }

    /// The tensor shape.
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// The raw residues.
    pub fn values(&self) -> &ArrayD<u64> {
        &self.values
    }

    /// The single residue of a 0-dimensional tensor.
    pub fn scalar(&self) -> Option<u64> {
        if self.values.ndim() == 0 {
            self.values.iter().next().copied()
        } else {
            None
        }
    }

    fn check_compatible(&self, other: &Self) -> Result<(), TensorError> {
        if self.q != other.q {
            return Err(TensorError::ModulusMismatch {
                lhs: self.q,
                rhs: other.q,
            });
        }
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape().to_vec(),
                rhs: other.shape().to_vec(),
            });
        }
        Ok(())
    }

    fn zip_with(&self, other: &Self, f: impl Fn(u128, u128, u128) -> u128) -> Self {
        let q = self.q as u128;
        let mut values = Vec::with_capacity(self.values.len());
        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            values.push(f(a as u128, b as u128, q) as u64);
        }
        let values = ArrayD::from_shape_vec(self.values.raw_dim(), values)
            .expect("zip preserves the element count");
        RingTensor { values, q: self.q }
    }

    /// Elementwise addition in the ring.
    pub fn add(&self, other: &Self) -> Result<Self, TensorError> {
        self.check_compatible(other)?;
        Ok(self.zip_with(other, |a, b, q| (a + b) % q))
    }

    /// Elementwise subtraction in the ring.
    pub fn sub(&self, other: &Self) -> Result<Self, TensorError> {
        self.check_compatible(other)?;
        Ok(self.zip_with(other, |a, b, q| (a + q - b) % q))
    }

    /// Adds a public ring element to every entry.
    pub fn add_scalar(&self, s: u64) -> Self {
        let q = self.q as u128;
        let s = s as u128 % q;
        let values = self.values.mapv(|a| ((a as u128 + s) % q) as u64);
        RingTensor { values, q: self.q }
    }

    /// Multiplies every entry by a public ring element.
    pub fn mul_scalar(&self, s: u64) -> Self {
        let q = self.q as u128;
        let s = s as u128 % q;
        let values = self.values.mapv(|a| (a as u128 * s % q) as u64);
        RingTensor { values, q: self.q }
    }

    /// Reduces every entry modulo `m`, leaving the ring modulus unchanged.
    pub fn rem(&self, m: u64) -> Result<Self, TensorError> {
        if m == 0 {
            return Err(TensorError::ZeroModulus);
        }
        Ok(RingTensor {
            values: self.values.mapv(|a| a % m),
            q: self.q,
        })
    }

    /// Tensor contraction along the leading axis, modulo `q`.
    ///
    /// For operands of shape `[k, ..m]` and `[k, ..n]` the result has shape
    /// `[..m, ..n]`: two vectors contract to a 0-dimensional inner product,
    /// two matrices to the product of their transposed-first factors.
    pub fn dot(&self, other: &Self) -> Result<Self, TensorError> {
        if self.q != other.q {
            return Err(TensorError::ModulusMismatch {
                lhs: self.q,
                rhs: other.q,
            });
        }
        let (ls, rs) = (self.shape(), other.shape());
        if ls.is_empty() || rs.is_empty() || ls[0] != rs[0] || ls[0] == 0 {
            return Err(TensorError::ContractionMismatch {
                lhs: ls.to_vec(),
                rhs: rs.to_vec(),
            });
        }
        let k = ls[0];
        let m: usize = ls[1..].iter().product();
        let n: usize = rs[1..].iter().product();
        let q = self.q as u128;

        // Row-major flat views; entry (t, i) of the left operand is lhs[t * m + i].
        let lhs: Vec<u64> = self.values.iter().copied().collect();
        let rhs: Vec<u64> = other.values.iter().copied().collect();
        let mut out = vec![0u64; m * n];
        for t in 0..k {
            for i in 0..m {
                let a = lhs[t * m + i] as u128;
                if a == 0 {
                    continue;
                }
                for j in 0..n {
                    let p = a * rhs[t * n + j] as u128 % q;
                    let acc = out[i * n + j] as u128;
                    out[i * n + j] = ((acc + p) % q) as u64;
                }
            }
        }
        let shape: Vec<usize> = ls[1..].iter().chain(rs[1..].iter()).copied().collect();
        let values = ArrayD::from_shape_vec(IxDyn(&shape), out)
            .expect("output length is the product of the output shape");
        Ok(RingTensor { values, q: self.q })
    }
}
