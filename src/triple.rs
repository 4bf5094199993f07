//! Beaver-triple generation, assisted by homomorphic encryption.
//!
//! A triple is a secret sharing of `(a, b, c)` with `c = a · b` in the ring,
//! for fresh uniformly random `a` and `b`. The cross terms `a_i · b_j` between
//! two parties are computed blind: party `i` publishes an encryption of its
//! `a` share, party `j` contracts it with its own `b` share under encryption
//! and masks the result with fresh randomness before returning it, so no
//! single party ever learns a cross term — or the product — in the clear.
//! This exchange is the dominant cost of a secure multiplication; the whole
//! tensor travels in a single ciphertext batch per direction.

use std::fmt;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::{
    channel::{self, Channel},
    he::{self, CipherTensor, HeScheme},
    session::Session,
    tensor::{RingTensor, TensorError},
};

/// Errors occurring during triple generation.
#[derive(Debug)]
pub enum Error {
    /// A message could not be sent or received.
    Channel(channel::Error),
    /// The requested operand shapes cannot be contracted.
    Tensor(TensorError),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Channel(e) => write!(f, "channel error: {e}"),
            Error::Tensor(e) => write!(f, "tensor error: {e}"),
        }
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Error::Channel(e)
    }
}

impl From<TensorError> for Error {
    fn from(e: TensorError) -> Self {
        Error::Tensor(e)
    }
}

/// One party's shares of the correlated randomness for a single secure
/// multiplication.
///
/// A triple is consumed by value and cannot be cloned, so using it for a
/// second multiplication is impossible by construction:
///
/// ```compile_fail
/// fn assert_clone<T: Clone>() {}
/// assert_clone::<splitdot::triple::BeaverTriple>();
/// ```
#[derive(Debug)]
pub struct BeaverTriple {
    pub(crate) a: RingTensor,
    pub(crate) b: RingTensor,
    pub(crate) c: RingTensor,
}

/// Generates a fresh triple of shapes matching a dot product of
/// `x_shape · y_shape`, under names derived from `name`.
pub async fn generate<C: Channel + Send, H: HeScheme + Send>(
    session: &mut Session<C, H>,
    x_shape: &[usize],
    y_shape: &[usize],
    name: &str,
) -> Result<BeaverTriple, Error> {
    let q = session.cfg.q_field;
    let me = session.cfg.party;
    let mut rng = ChaCha20Rng::from_os_rng();

    let a = RingTensor::uniform(x_shape, q, &mut rng);
    let b = RingTensor::uniform(y_shape, q, &mut rng);
    // Fails before any message leaves the party if the shapes do not
    // contract, since all parties sample the same shapes.
    let mut c = a.dot(&b)?;
    debug!(name, party = me, "generating beaver triple");

    let enc_a = he::encrypt_tensor(&session.he, &a);
    session.comm.broadcast(&format!("{name}_a{me}"), &enc_a).await?;

    // For every peer: contract their encrypted `a` share with our `b` share,
    // mask it and return it. The mask re-randomizes the ciphertext and our
    // share keeps its negation, so the sum over all parties is unchanged.
    let peers: Vec<usize> = session.comm.other_parties().collect();
    for &j in &peers {
        let enc_aj: CipherTensor<H> = session.comm.recv_from(j, &format!("{name}_a{j}")).await?;
        let mask = RingTensor::uniform(c.shape(), q, &mut rng);
        let cross = he::dot_plain(&session.he, &enc_aj, &b)?;
        let cross = he::add_plain_tensor(&session.he, &cross, &mask)?;
        session
            .comm
            .send_to(j, &format!("{name}_cross_a{j}_b{me}"), &cross)
            .await?;
        c = c.sub(&mask)?;
    }

    // Collect our own masked cross terms from every peer.
    for &j in &peers {
        let cross: CipherTensor<H> = session
            .comm
            .recv_from(j, &format!("{name}_cross_a{me}_b{j}"))
            .await?;
        c = c.add(&he::decrypt_tensor(&session.he, &cross, q))?;
    }
    debug!(name, party = me, "beaver triple ready");

    Ok(BeaverTriple { a, b, c })
}

#[cfg(test)]
mod tests {
    use crate::protocol::{SharedTensor, simulate};

    const Q: u64 = 18_446_744_073_709_551_557;

    #[tokio::test]
    async fn generated_triples_are_sound() {
        for parties in [2, 3] {
            triple_soundness(parties).await;
        }
    }

    async fn triple_soundness(parties: usize) {
        let results = simulate(parties, Q, |_, mut session| async move {
            let name = session.next_name();
            let triple = super::generate(&mut session, &[3], &[3], &name).await?;
            let a = SharedTensor::from_encoded(triple.a, Some(format!("{name}_a")));
            let b = SharedTensor::from_encoded(triple.b, Some(format!("{name}_b")));
            let c = SharedTensor::from_encoded(triple.c, Some(format!("{name}_c")));
            let a = a.reconstruct(&mut session, None).await?;
            let b = b.reconstruct(&mut session, None).await?;
            let c = c.reconstruct(&mut session, None).await?;
            Ok((a, b, c))
        })
        .await;
        for result in results {
            let (a, b, c) = result.unwrap();
            assert_eq!(a.value().dot(b.value()).unwrap(), *c.value());
        }
    }

    #[tokio::test]
    async fn triples_differ_between_invocations() {
        let results = simulate(2, Q, |_, mut session| async move {
            let n1 = session.next_name();
            let t1 = super::generate(&mut session, &[4], &[4], &n1).await?;
            let n2 = session.next_name();
            let t2 = super::generate(&mut session, &[4], &[4], &n2).await?;
            Ok((t1.a, t2.a))
        })
        .await;
        for result in results {
            let (a1, a2) = result.unwrap();
            assert_ne!(a1, a2);
        }
    }
}
