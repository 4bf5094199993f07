//! A Rust implementation of secure multi-party computation (MPC) over
//! secret-shared fixed-point tensors.
//!
//! Two or more parties jointly compute linear algebra — addition, scaling,
//! dot products — over private tensors, while each party only ever holds
//! additive secret shares of the true values. Multiplications use
//! Beaver triples generated with the help of an additively homomorphic
//! encryption scheme; a value is only revealed when all parties explicitly
//! reconstruct it.
//!
//! ## Main Components
//!
//! The crate is structured into several modules:
//!
//! * [`protocol`]: The [`protocol::SharedTensor`] type with its local and
//!   secure operators, and the reconstruction protocol.
//! * [`session`]: The per-party session context fixing ring, encoding, roles
//!   and operation naming.
//! * [`channel`]: Communication abstractions for exchanging shares between
//!   parties.
//! * [`codec`]: Fixed-point encoding of real tensors into the ring,
//!   including post-multiplication truncation.
//! * [`triple`]: Beaver-triple generation.
//! * [`he`]: The homomorphic-encryption capability consumed by triple
//!   generation.
//! * [`tensor`]: Ring tensor arithmetic.
//!
//! ## Basic Usage
//!
//! To run a secure computation, each participating party needs to:
//!
//! 1. Set up communication channels with the other parties
//! 2. Establish a [`session::Session`] with the agreed ring and encoding
//! 3. Secret-share its private inputs and receive shares of the others'
//! 4. Apply tensor operations, issued by all parties in the same order
//! 5. Reconstruct the results that may be revealed
//!
//! ## Example
//!
//! ```no_run
//! use splitdot::{
//!     channel::SimpleChannel,
//!     he::insecure::InsecureHe,
//!     protocol::SharedTensor,
//!     session::{Session, SessionConfig},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(channel: SimpleChannel) -> Result<(), Box<dyn std::error::Error>> {
//! // Party 1 of a 2-party session over a prime ring:
//! let q = 18_446_744_073_709_551_557;
//! let cfg = SessionConfig::new(2, 1, q);
//! let mut session = Session::establish(channel, InsecureHe::new(q), cfg,
//!     CancellationToken::new()).await?;
//!
//! // Party 0 contributes a vector, this party receives its share:
//! let x = SharedTensor::receive(&mut session, 0, None).await?;
//! // This party contributes a vector of its own:
//! let y = SharedTensor::share(&mut session, &ndarray::arr1(&[3.0, 4.0]).into_dyn(), None).await?;
//!
//! // Both parties run the same operations in the same order:
//! let xy = x.dot(&y, &mut session, None).await?;
//! let revealed = xy.open(&mut session, None).await?;
//! println!("dot(x, y) = {revealed}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! This implementation targets semi-honest adversaries: parties follow the
//! protocol but may try to learn more than the revealed outputs. No proper
//! subset of parties can recover a secret value from its shares, and the
//! masked values revealed during multiplication are information-theoretically
//! independent of the secrets. The homomorphic scheme shipped in
//! [`he::insecure`] offers no protection at all and exists for tests and
//! simulations; production deployments must plug in a real scheme.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod codec;
pub mod he;
pub mod protocol;
pub mod session;
pub mod tensor;
pub mod triple;
