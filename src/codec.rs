//! Fixed-point encoding of real-valued tensors into the ring.
//!
//! A real number `x` is represented as `round(x * base^frac) mod q`; residues
//! above `q / 2` represent negative numbers. Multiplying two encoded values
//! doubles the fractional width, so every secure multiplication is followed by
//! [`FixedPointCodec::truncate`], which divides the shares back down to a
//! single fractional width. The division is lossy per share; the primary party
//! owns the rounding-correction term so that the sum of all post-truncation
//! shares reconstructs the truncated value rather than drifting by one unit
//! per party.

use ndarray::ArrayD;
use thiserror::Error;

use crate::{session::Role, tensor::RingTensor};

/// Errors raised when encoding values or constructing a codec.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    /// The value cannot be represented with the configured modulus and scale.
    #[error("value {0} exceeds the representable range of the encoding")]
    OutOfRange(f64),
    /// The codec parameters are inconsistent.
    #[error("invalid codec parameters: {0}")]
    InvalidParams(&'static str),
}

/// How to treat values whose magnitude exceeds the representable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// Silently wrap around the ring modulus. Callers are expected to bound
    /// input magnitudes themselves.
    #[default]
    Wrap,
    /// Fail fast with [`CodecError::OutOfRange`] instead of wrapping.
    Strict,
}

/// Converts between real-valued tensors and [`RingTensor`]s.
#[derive(Debug, Clone)]
pub struct FixedPointCodec {
    q: u64,
    base: u32,
    frac: u32,
    scale: u64,
    policy: RangePolicy,
}

impl FixedPointCodec {
    /// Creates a codec for the ring modulo `q` with scale factor `base^frac`.
    pub fn new(q: u64, base: u32, frac: u32, policy: RangePolicy) -> Result<Self, CodecError> {
        if q < 3 || q % 2 == 0 {
            return Err(CodecError::InvalidParams("modulus must be odd and >= 3"));
        }
        if base < 2 {
            return Err(CodecError::InvalidParams("base must be >= 2"));
        }
        let scale = (base as u64)
            .checked_pow(frac)
            .filter(|&s| s < q)
            .ok_or(CodecError::InvalidParams(
                "base^frac must be smaller than the modulus",
            ))?;
        Ok(FixedPointCodec {
            q,
            base,
            frac,
            scale,
            policy,
        })
    }

    /// The ring modulus.
    pub fn modulus(&self) -> u64 {
        self.q
    }

    /// The encoding radix.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The number of fractional digits.
    pub fn frac(&self) -> u32 {
        self.frac
    }

    /// The scale factor `base^frac`.
    pub fn scale(&self) -> u64 {
        self.scale
    }

    /// Encodes a single real number as a ring element.
    pub fn encode_f64(&self, x: f64) -> Result<u64, CodecError> {
        let scaled = (x * self.scale as f64).round();
        if self.policy == RangePolicy::Strict
            && !(scaled.is_finite() && scaled.abs() <= (self.q / 2) as f64)
        {
            return Err(CodecError::OutOfRange(x));
        }
        Ok((scaled as i128).rem_euclid(self.q as i128) as u64)
    }

    /// Decodes a ring element back to a real number, recovering the sign via
    /// the wrap-around convention.
    pub fn decode_f64(&self, v: u64) -> f64 {
        let signed = if v > self.q / 2 {
            v as i128 - self.q as i128
        } else {
            v as i128
        };
        signed as f64 / self.scale as f64
    }

    /// Encodes a real-valued tensor elementwise.
    pub fn encode(&self, x: &ArrayD<f64>) -> Result<RingTensor, CodecError> {
        let mut values = Vec::with_capacity(x.len());
        for &v in x.iter() {
            values.push(self.encode_f64(v)?);
        }
        let values = ArrayD::from_shape_vec(x.raw_dim(), values)
            .expect("encoding preserves the element count");
        Ok(RingTensor::new(values, self.q))
    }

    /// Decodes a ring tensor elementwise.
    pub fn decode(&self, t: &RingTensor) -> ArrayD<f64> {
        t.values().mapv(|v| self.decode_f64(v))
    }

    /// Rescales a share after a multiplication, dividing out one scale factor.
    ///
    /// Replicas floor-divide their share. The primary instead computes
    /// `q - (q - v) / scale`, absorbing the rounding error of the divisions so
    /// that the shares still sum to the truncated value. For a two-party
    /// sharing of a value well below `q`, the reconstruction error is at most
    /// one unit in the last fractional digit (except with probability
    /// `|value| / q`, when the share sum wraps the ring an unexpected number
    /// of times). Beyond two parties the share sum can wrap more than once
    /// and the primary's correction no longer covers every wrap; see the
    /// secure dot product documentation.
    pub fn truncate(&self, t: &RingTensor, role: Role) -> RingTensor {
        let q = self.q as u128;
        let scale = self.scale as u128;
        let values = t.values().mapv(|v| match role {
            Role::Primary => ((q - (q - v as u128) / scale) % q) as u64,
            Role::Replica => (v as u128 / scale) as u64,
        });
        RingTensor::new(values, self.q)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;
    use proptest::prelude::*;

    use super::{CodecError, FixedPointCodec, RangePolicy};
    use crate::{session::Role, tensor::RingTensor};

    const Q: u64 = 18_446_744_073_709_551_557; // largest prime below 2^64

    fn codec(base: u32, frac: u32) -> FixedPointCodec {
        FixedPointCodec::new(Q, base, frac, RangePolicy::Wrap).unwrap()
    }

    #[test]
    fn negative_value_roundtrips_exactly() {
        let c = codec(10, 2);
        let encoded = c.encode_f64(-1.5).unwrap();
        assert_eq!(encoded, Q - 150);
        assert_eq!(c.decode_f64(encoded), -1.5);
    }

    #[test]
    fn tensor_roundtrip() {
        let c = codec(10, 4);
        let x = arr1(&[1.0, -2.0, 0.0, 3.1415]).into_dyn();
        let decoded = c.decode(&c.encode(&x).unwrap());
        for (a, b) in x.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn strict_mode_rejects_out_of_range() {
        let c = FixedPointCodec::new(101, 10, 1, RangePolicy::Strict).unwrap();
        assert_eq!(c.encode_f64(4.0).unwrap(), 40);
        assert_eq!(c.encode_f64(-4.0).unwrap(), 101 - 40);
        assert_eq!(c.encode_f64(20.0), Err(CodecError::OutOfRange(20.0)));
        assert_eq!(c.encode_f64(-20.0), Err(CodecError::OutOfRange(-20.0)));
        assert!(matches!(
            c.encode_f64(f64::NAN),
            Err(CodecError::OutOfRange(_))
        ));
    }

    #[test]
    fn wrap_mode_wraps_silently() {
        let c = FixedPointCodec::new(101, 10, 1, RangePolicy::Wrap).unwrap();
        // 20.0 encodes to 200 mod 101 = 99, which decodes as -0.2.
        assert_eq!(c.encode_f64(20.0).unwrap(), 99);
        assert_eq!(c.decode_f64(99), -0.2);
    }

    #[test]
    fn invalid_params_are_rejected() {
        assert!(FixedPointCodec::new(100, 10, 2, RangePolicy::Wrap).is_err());
        assert!(FixedPointCodec::new(101, 1, 2, RangePolicy::Wrap).is_err());
        assert!(FixedPointCodec::new(101, 10, 3, RangePolicy::Wrap).is_err());
    }

    #[test]
    fn truncation_restores_single_precision_across_shares() {
        let c = codec(10, 2);
        // A two-share splitting of encode(2.25) * encode(4.0) = 225 * 400,
        // which carries a doubled fractional width of 4 digits.
        let product = 90_000u64;
        let share_1 = 123_456_789u64;
        let share_0 = ((product as u128 + Q as u128 - share_1 as u128) % Q as u128) as u64;
        let t0 = RingTensor::new(arr1(&[share_0]).into_dyn(), Q);
        let t1 = RingTensor::new(arr1(&[share_1]).into_dyn(), Q);
        let r0 = c.truncate(&t0, Role::Primary);
        let r1 = c.truncate(&t1, Role::Replica);
        let sum = r0.add(&r1).unwrap();
        let decoded = c.decode_f64(sum.values().as_slice().unwrap()[0]);
        assert!((decoded - 9.0).abs() < 0.02, "{decoded}");
    }

    proptest! {
        #[test]
        fn roundtrip_within_representable_range(x in -1_000_000.0f64..1_000_000.0) {
            let c = codec(10, 4);
            let decoded = c.decode_f64(c.encode_f64(x).unwrap());
            prop_assert!((x - decoded).abs() <= 0.5 / c.scale() as f64 + 1e-9);
        }
    }
}
