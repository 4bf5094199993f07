//! The homomorphic-encryption capability consumed by triple generation.
//!
//! The protocol only relies on a *partially* homomorphic scheme: ciphertexts
//! can be added together and multiplied by plaintexts, but never multiplied
//! with each other. That restriction is exactly what makes the Beaver-triple
//! indirection necessary — and sufficient — for secure multiplication.
//!
//! The scheme is consumed as an opaque capability via [`HeScheme`]; a real
//! deployment plugs in an additively homomorphic cryptosystem such as
//! Paillier. The scheme must be homomorphic modulo the session ring, or have
//! a plaintext space large enough that no intermediate value is ever reduced
//! before decryption.

use std::fmt;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::tensor::{RingTensor, TensorError};

/// An additively homomorphic encryption scheme over ring elements.
pub trait HeScheme {
    /// An encrypted ring element.
    type Ciphertext: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Encrypts a ring element under the scheme's public key.
    fn encrypt(&self, m: u64) -> Self::Ciphertext;

    /// Decrypts a ciphertext with the scheme's private key.
    fn decrypt(&self, ct: &Self::Ciphertext) -> u64;

    /// Adds two ciphertexts, yielding an encryption of the sum.
    fn add(&self, a: &Self::Ciphertext, b: &Self::Ciphertext) -> Self::Ciphertext;

    /// Adds a plaintext to a ciphertext.
    fn add_plain(&self, a: &Self::Ciphertext, m: u64) -> Self::Ciphertext;

    /// Multiplies a ciphertext by a plaintext.
    fn mul_plain(&self, a: &Self::Ciphertext, m: u64) -> Self::Ciphertext;
}

/// An elementwise-encrypted tensor, the wire format of triple generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct CipherTensor<S: HeScheme> {
    values: ArrayD<S::Ciphertext>,
}

impl<S: HeScheme> CipherTensor<S> {
    /// The tensor shape.
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }
}

/// Encrypts a ring tensor elementwise.
pub fn encrypt_tensor<S: HeScheme>(scheme: &S, t: &RingTensor) -> CipherTensor<S> {
    CipherTensor {
        values: t.values().map(|&v| scheme.encrypt(v)),
    }
}

/// Decrypts a ciphertext tensor elementwise, reducing into the ring mod `q`.
pub fn decrypt_tensor<S: HeScheme>(scheme: &S, t: &CipherTensor<S>, q: u64) -> RingTensor {
    RingTensor::new(t.values.map(|ct| scheme.decrypt(ct) % q), q)
}

/// Contracts an encrypted tensor with a plaintext tensor along the leading
/// axis, entirely under encryption: products via [`HeScheme::mul_plain`], sums
/// via [`HeScheme::add`].
pub fn dot_plain<S: HeScheme>(
    scheme: &S,
    enc: &CipherTensor<S>,
    plain: &RingTensor,
) -> Result<CipherTensor<S>, TensorError> {
    let (ls, rs) = (enc.shape(), plain.shape());
    if ls.is_empty() || rs.is_empty() || ls[0] != rs[0] || ls[0] == 0 {
        return Err(TensorError::ContractionMismatch {
            lhs: ls.to_vec(),
            rhs: rs.to_vec(),
        });
    }
    let k = ls[0];
    let m: usize = ls[1..].iter().product();
    let n: usize = rs[1..].iter().product();

    let lhs: Vec<&S::Ciphertext> = enc.values.iter().collect();
    let rhs: Vec<u64> = plain.values().iter().copied().collect();
    let mut out: Vec<Option<S::Ciphertext>> = vec![None; m * n];
    for t in 0..k {
        for i in 0..m {
            let a = lhs[t * m + i];
            for j in 0..n {
                let p = scheme.mul_plain(a, rhs[t * n + j]);
                let acc = &mut out[i * n + j];
                *acc = Some(match acc.take() {
                    Some(acc) => scheme.add(&acc, &p),
                    None => p,
                });
            }
        }
    }
    let out: Vec<S::Ciphertext> = out
        .into_iter()
        .map(|ct| ct.expect("every output entry accumulates at least one term"))
        .collect();
    let shape: Vec<usize> = ls[1..].iter().chain(rs[1..].iter()).copied().collect();
    let values = ArrayD::from_shape_vec(ndarray::IxDyn(&shape), out)
        .expect("output length is the product of the output shape");
    Ok(CipherTensor { values })
}

/// Adds a plaintext mask tensor to a ciphertext tensor elementwise.
pub fn add_plain_tensor<S: HeScheme>(
    scheme: &S,
    enc: &CipherTensor<S>,
    mask: &RingTensor,
) -> Result<CipherTensor<S>, TensorError> {
    if enc.shape() != mask.shape() {
        return Err(TensorError::ShapeMismatch {
            lhs: enc.shape().to_vec(),
            rhs: mask.shape().to_vec(),
        });
    }
    let mask: Vec<u64> = mask.values().iter().copied().collect();
    let values: Vec<S::Ciphertext> = enc
        .values
        .iter()
        .zip(mask)
        .map(|(ct, m)| scheme.add_plain(ct, m))
        .collect();
    let values = ArrayD::from_shape_vec(enc.values.raw_dim(), values)
        .expect("masking preserves the element count");
    Ok(CipherTensor { values })
}

pub mod insecure {
    //! A plaintext-backed stand-in for the homomorphic scheme.
    //!
    //! "Ciphertexts" are the plaintext residues themselves and all operations
    //! reduce modulo the ring, so the scheme is trivially homomorphic modulo
    //! the session ring. Only suitable for tests, simulations and benchmarks.

    use serde::{Deserialize, Serialize};

    use super::HeScheme;

    /// The insecure scheme; see the module docs.
    #[derive(Debug, Clone)]
    pub struct InsecureHe {
        q: u64,
    }

    impl InsecureHe {
        /// A scheme that is homomorphic modulo `q`.
        pub fn new(q: u64) -> Self {
            InsecureHe { q }
        }
    }

    /// A "ciphertext" that is just the plaintext residue.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct PlainCiphertext(u64);

    impl HeScheme for InsecureHe {
        type Ciphertext = PlainCiphertext;

        fn encrypt(&self, m: u64) -> PlainCiphertext {
            PlainCiphertext(m % self.q)
        }

        fn decrypt(&self, ct: &PlainCiphertext) -> u64 {
            ct.0
        }

        fn add(&self, a: &PlainCiphertext, b: &PlainCiphertext) -> PlainCiphertext {
            PlainCiphertext(((a.0 as u128 + b.0 as u128) % self.q as u128) as u64)
        }

        fn add_plain(&self, a: &PlainCiphertext, m: u64) -> PlainCiphertext {
            PlainCiphertext(((a.0 as u128 + m as u128 % self.q as u128) % self.q as u128) as u64)
        }

        fn mul_plain(&self, a: &PlainCiphertext, m: u64) -> PlainCiphertext {
            PlainCiphertext((a.0 as u128 * (m as u128 % self.q as u128) % self.q as u128) as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::{add_plain_tensor, decrypt_tensor, dot_plain, encrypt_tensor, insecure::InsecureHe};
    use crate::tensor::RingTensor;

    const Q: u64 = 2_147_483_647;

    #[test]
    fn encrypted_dot_matches_plain_dot() {
        let scheme = InsecureHe::new(Q);
        let a = RingTensor::new(arr1(&[3u64, 5, 7]).into_dyn(), Q);
        let b = RingTensor::new(arr1(&[11u64, 13, 17]).into_dyn(), Q);
        let enc = encrypt_tensor(&scheme, &a);
        let ct = dot_plain(&scheme, &enc, &b).unwrap();
        let result = decrypt_tensor(&scheme, &ct, Q);
        assert_eq!(result, a.dot(&b).unwrap());
    }

    #[test]
    fn masked_dot_carries_the_mask() {
        let scheme = InsecureHe::new(Q);
        let a = RingTensor::new(arr1(&[2u64, 4]).into_dyn(), Q);
        let b = RingTensor::new(arr1(&[6u64, 8]).into_dyn(), Q);
        let mask = RingTensor::new(ndarray::ArrayD::from_elem(ndarray::IxDyn(&[]), 100u64), Q);
        let enc = encrypt_tensor(&scheme, &a);
        let ct = add_plain_tensor(&scheme, &dot_plain(&scheme, &enc, &b).unwrap(), &mask).unwrap();
        let unmasked = decrypt_tensor(&scheme, &ct, Q).sub(&mask).unwrap();
        assert_eq!(unmasked, a.dot(&b).unwrap());
    }
}
