//! Secure computation over secret-shared fixed-point tensors.
//!
//! This module provides the central value type of the crate: a
//! [`SharedTensor`] is one party's additive share of a real-valued tensor
//! that no single party knows. Linear operators (addition, subtraction,
//! scaling) are purely local; dot products between two shared tensors run the
//! Beaver-triple protocol and cost one triple generation plus two
//! reconstruction rounds; [`SharedTensor::reconstruct`] is the only operation
//! that reveals a value.
//!
//! All parties must issue the same operations in the same order. Operation
//! names derived from the session's naming sequence tie each message to its
//! communication round, so a desynchronized peer surfaces as an
//! unexpected-tag error instead of garbage values.

use std::{fmt, future::Future};

use futures::future::join_all;
use ndarray::ArrayD;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    channel::{self, Channel, SimpleChannel},
    codec::{CodecError, FixedPointCodec},
    he::{HeScheme, insecure::InsecureHe},
    session::{Role, Session, SessionConfig, SessionError},
    tensor::{RingTensor, TensorError},
    triple::{self, BeaverTriple},
};

/// A custom error type for secure tensor operations.
#[derive(Debug)]
pub enum Error {
    /// A message could not be sent or received.
    Channel(channel::Error),
    /// A value could not be encoded or decoded.
    Codec(CodecError),
    /// Ring tensor arithmetic failed, e.g. on a shape mismatch.
    Tensor(TensorError),
    /// Beaver-triple generation failed.
    Triple(triple::Error),
    /// The session could not be established.
    Session(SessionError),
    /// The tensor has no name, so its shares cannot be matched on the wire.
    MissingTensorName,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Channel(e) => write!(f, "channel error: {e}"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::Tensor(e) => write!(f, "tensor error: {e}"),
            Error::Triple(e) => write!(f, "triple generation error: {e}"),
            Error::Session(e) => write!(f, "session error: {e}"),
            Error::MissingTensorName => f.write_str("the tensor has no name"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Error::Channel(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<TensorError> for Error {
    fn from(e: TensorError) -> Self {
        Error::Tensor(e)
    }
}

impl From<triple::Error> for Error {
    fn from(e: triple::Error) -> Self {
        Error::Triple(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::Session(e)
    }
}

/// One party's additive share of a secret fixed-point tensor.
///
/// The tensor name identifies the value across all parties; shares of the
/// same logical value carry the same name on every party. Tensors produced by
/// local arithmetic are unnamed until a name is attached with
/// [`SharedTensor::with_name`] or supplied at reconstruction.
#[derive(Debug, Clone)]
pub struct SharedTensor {
    tensor_name: Option<String>,
    value: RingTensor,
}

impl SharedTensor {
    /// Wraps an already ring-encoded local share.
    pub fn from_encoded(value: RingTensor, tensor_name: Option<String>) -> Self {
        SharedTensor { tensor_name, value }
    }

    /// Encodes a locally known plaintext and splits it into shares: every
    /// other party receives a fresh uniformly random share under the tensor
    /// name, the caller keeps the remainder. The other parties must call
    /// [`SharedTensor::receive`] with matching arguments.
    pub async fn share<C: Channel + Send, H: HeScheme + Send>(
        session: &mut Session<C, H>,
        plaintext: &ArrayD<f64>,
        tensor_name: Option<String>,
    ) -> Result<Self, Error> {
        let name = tensor_name.unwrap_or_else(|| session.next_name());
        let q = session.cfg.q_field;
        let encoded = session.codec.encode(plaintext)?;
        let mut rng = ChaCha20Rng::from_os_rng();
        let mut own = encoded;
        let peers: Vec<usize> = session.comm.other_parties().collect();
        for party in peers {
            let share = RingTensor::uniform(own.shape(), q, &mut rng);
            session.comm.send_to(party, &name, &share).await?;
            own = own.sub(&share)?;
        }
        debug!(name = name.as_str(), "secret-shared local plaintext");
        Ok(SharedTensor {
            tensor_name: Some(name),
            value: own,
        })
    }

    /// Receives this party's share of a tensor secret-shared by `source`.
    pub async fn receive<C: Channel + Send, H: HeScheme + Send>(
        session: &mut Session<C, H>,
        source: usize,
        tensor_name: Option<String>,
    ) -> Result<Self, Error> {
        let name = tensor_name.unwrap_or_else(|| session.next_name());
        let value: RingTensor = session.comm.recv_from(source, &name).await?;
        if value.modulus() != session.cfg.q_field {
            return Err(TensorError::ModulusMismatch {
                lhs: session.cfg.q_field,
                rhs: value.modulus(),
            }
            .into());
        }
        Ok(SharedTensor {
            tensor_name: Some(name),
            value,
        })
    }

    /// The tensor name, if any.
    pub fn tensor_name(&self) -> Option<&str> {
        self.tensor_name.as_deref()
    }

    /// Returns the share under a new name, e.g. to overwrite a live value.
    pub fn with_name(mut self, tensor_name: impl Into<String>) -> Self {
        self.tensor_name = Some(tensor_name.into());
        self
    }

    /// The local share; one summand of the secret value, meaningless alone.
    pub fn value(&self) -> &RingTensor {
        &self.value
    }

    /// The tensor shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// Elementwise addition of two shared tensors; local, the result is a
    /// valid share of the sum.
    pub fn add(&self, other: &Self) -> Result<Self, Error> {
        Ok(SharedTensor {
            tensor_name: None,
            value: self.value.add(&other.value)?,
        })
    }

    /// Elementwise subtraction of two shared tensors; local.
    pub fn sub(&self, other: &Self) -> Result<Self, Error> {
        Ok(SharedTensor {
            tensor_name: None,
            value: self.value.sub(&other.value)?,
        })
    }

    /// Adds a public constant to the secret value. All parties call this in
    /// lockstep, but only the primary adds the encoded constant to its share;
    /// adding it on every party would multiply the constant by the party
    /// count in the reconstructed sum.
    pub fn add_scalar<C: Channel, H: HeScheme>(
        &self,
        constant: f64,
        session: &Session<C, H>,
    ) -> Result<Self, Error> {
        let value = match session.role() {
            Role::Primary => self.value.add_scalar(session.codec.encode_f64(constant)?),
            Role::Replica => self.value.clone(),
        };
        Ok(SharedTensor {
            tensor_name: None,
            value,
        })
    }

    /// Multiplies the secret value by a public integer scalar. Safe to apply
    /// identically on all parties, since scaling distributes over the share
    /// sum.
    pub fn scale(&self, scalar: i64) -> Self {
        let q = self.value.modulus();
        let s = (scalar as i128).rem_euclid(q as i128) as u64;
        SharedTensor {
            tensor_name: None,
            value: self.value.mul_scalar(s),
        }
    }

    /// Reduces the share representation modulo `m`; a maintenance operation
    /// on the ring representation, not a semantic division.
    pub fn rem(&self, m: u64) -> Result<Self, Error> {
        Ok(SharedTensor {
            tensor_name: None,
            value: self.value.rem(m)?,
        })
    }

    /// Secure dot product of two secret tensors, contracting the leading
    /// axis.
    ///
    /// Consumes one fresh Beaver triple and two reconstruction rounds of
    /// masked values: `x + a` and `y + b` are revealed, which is safe because
    /// `a` and `b` are uniformly random and unknown to any single party. The
    /// revealed values and the triple cancel algebraically so that the
    /// parties' result shares sum to `dot(x, y)`, with the primary
    /// contributing the revealed-product term exactly once. The product
    /// doubles the fractional width, so the result is truncated before it is
    /// returned; the new share is never revealed unless explicitly
    /// reconstructed.
    ///
    /// The truncation step guarantees at most one unit of error in the last
    /// fractional digit for two-party sessions. In larger sessions the share
    /// sum can wrap the ring more than once, which the single-owner
    /// correction does not cover; the result then carries a large error with
    /// non-negligible probability.
    pub async fn dot<C: Channel + Send, H: HeScheme + Send>(
        &self,
        other: &Self,
        session: &mut Session<C, H>,
        target_name: Option<String>,
    ) -> Result<Self, Error> {
        let target = target_name.unwrap_or_else(|| session.next_name());
        let BeaverTriple { a, b, c } =
            triple::generate(session, self.shape(), other.shape(), &target).await?;

        let x_add_a = SharedTensor {
            tensor_name: Some(format!("{target}_confuse_x")),
            value: self.value.add(&a)?,
        };
        let x_add_a = x_add_a.reconstruct(session, None).await?;
        let y_add_b = SharedTensor {
            tensor_name: Some(format!("{target}_confuse_y")),
            value: other.value.add(&b)?,
        };
        let y_add_b = y_add_b.reconstruct(session, None).await?;

        let mut cross = c
            .sub(&a.dot(y_add_b.value())?)?
            .sub(&x_add_a.value().dot(&b)?)?;
        if session.role() == Role::Primary {
            cross = cross.add(&x_add_a.value().dot(y_add_b.value())?)?;
        }
        let value = session.codec.truncate(&cross, session.role());
        debug!(name = target.as_str(), "secure dot product complete");
        Ok(SharedTensor {
            tensor_name: Some(target),
            value,
        })
    }

    /// Collects every party's share and sums them, revealing the secret ring
    /// value. The local share is broadcast before any share is received, so
    /// all parties can reconstruct simultaneously.
    pub async fn reconstruct<C: Channel + Send, H: HeScheme + Send>(
        &self,
        session: &mut Session<C, H>,
        tensor_name: Option<&str>,
    ) -> Result<PublicTensor, Error> {
        let name = tensor_name
            .or(self.tensor_name.as_deref())
            .ok_or(Error::MissingTensorName)?;
        let tag = format!("{name}_open");
        session.comm.broadcast(&tag, &self.value).await?;
        let mut sum = self.value.clone();
        for (_, share) in session.comm.recv_from_all::<RingTensor>(&tag).await? {
            sum = sum.add(&share)?;
        }
        debug!(name, "reconstructed tensor");
        Ok(PublicTensor { value: sum })
    }

    /// Reconstructs and decodes the secret value in one step.
    pub async fn open<C: Channel + Send, H: HeScheme + Send>(
        &self,
        session: &mut Session<C, H>,
        tensor_name: Option<&str>,
    ) -> Result<ArrayD<f64>, Error> {
        let revealed = self.reconstruct(session, tensor_name).await?;
        Ok(revealed.decode(&session.codec))
    }
}

/// A ring-encoded tensor that is fully known to the local party: a public
/// constant or the result of a reconstruction.
///
/// Keeping public and shared values as distinct types rules out the silent
/// misuse of a secret share where a known value is required (and vice versa)
/// at compile time.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicTensor {
    value: RingTensor,
}

impl PublicTensor {
    /// Encodes a locally known plaintext as a public ring tensor.
    pub fn from_plaintext(codec: &FixedPointCodec, x: &ArrayD<f64>) -> Result<Self, Error> {
        Ok(PublicTensor {
            value: codec.encode(x)?,
        })
    }

    /// The ring values.
    pub fn value(&self) -> &RingTensor {
        &self.value
    }

    /// Decodes to a real-valued tensor.
    pub fn decode(&self, codec: &FixedPointCodec) -> ArrayD<f64> {
        codec.decode(&self.value)
    }

    /// Dot product of two fully known tensors; no communication, no
    /// cryptography. Must never be used on values that are still secret.
    pub fn dot_local(&self, other: &Self) -> Result<Self, Error> {
        Ok(PublicTensor {
            value: self.value.dot(&other.value)?,
        })
    }

    /// Divides out one scale factor after a product of two encoded values,
    /// recovering the sign via the wrap-around convention. The public
    /// counterpart of the share-wise truncation inside the secure dot
    /// product.
    pub fn rescale(&self, codec: &FixedPointCodec) -> Self {
        let q = codec.modulus() as u128;
        let scale = codec.scale() as u128;
        let values = self.value.values().mapv(|v| {
            if v as u128 > q / 2 {
                (q - (q - v as u128) / scale) as u64 % q as u64
            } else {
                (v as u128 / scale) as u64
            }
        });
        PublicTensor {
            value: RingTensor::new(values, codec.modulus()),
        }
    }
}

/// Simulates a multi-party session in a single process, for tests and
/// examples: every party runs `f` in its own task, connected through
/// [`SimpleChannel`]s and using the insecure plaintext homomorphic scheme.
pub async fn simulate<T, Fut>(
    parties: usize,
    q_field: u64,
    f: impl Fn(usize, Session<SimpleChannel, InsecureHe>) -> Fut + Clone + Send + 'static,
) -> Vec<Result<T, Error>>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    let channels = SimpleChannel::channels(parties);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::with_capacity(parties);
    for (party, channel) in channels.into_iter().enumerate() {
        let f = f.clone();
        let cancel = cancel.clone();
        let cfg = SessionConfig::new(parties, party, q_field);
        tasks.push(task::spawn(async move {
            let session = Session::establish(channel, InsecureHe::new(q_field), cfg, cancel).await?;
            f(party, session).await
        }));
    }
    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("simulated party panicked"))
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::{Error, SharedTensor, simulate};

    const Q: u64 = 18_446_744_073_709_551_557;

    #[tokio::test]
    async fn unnamed_tensor_cannot_be_reconstructed() {
        let results = simulate(2, Q, |party, mut session| async move {
            let x = if party == 0 {
                SharedTensor::share(&mut session, &arr1(&[1.0]).into_dyn(), None).await?
            } else {
                SharedTensor::receive(&mut session, 0, None).await?
            };
            let unnamed = x.add(&x)?;
            unnamed.reconstruct(&mut session, None).await.map(|_| ())
        })
        .await;
        for result in results {
            assert!(matches!(result, Err(Error::MissingTensorName)));
        }
    }

    #[tokio::test]
    async fn with_name_aliases_a_share() {
        let results = simulate(2, Q, |party, mut session| async move {
            let x = if party == 0 {
                SharedTensor::share(&mut session, &arr1(&[2.5]).into_dyn(), None).await?
            } else {
                SharedTensor::receive(&mut session, 0, None).await?
            };
            let doubled = x.add(&x)?.with_name("doubled");
            doubled.open(&mut session, None).await
        })
        .await;
        for result in results {
            let opened = result.unwrap();
            assert!((opened.as_slice().unwrap()[0] - 5.0).abs() < 1e-4);
        }
    }
}
