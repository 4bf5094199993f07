//! Session context shared by all protocol operations.
//!
//! A [`Session`] fixes, for its whole lifetime, the ring modulus, the
//! fixed-point encoding, the set of parties and the local party's [`Role`].
//! It owns the transport channel, the homomorphic-encryption capability and
//! the naming sequence, so independent sessions can coexist in one process
//! and tests observe deterministic name sequences.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    channel::{self, Channel, MsgChannel},
    codec::{CodecError, FixedPointCodec, RangePolicy},
    he::HeScheme,
};

/// The role played by a party in the protocol.
///
/// Exactly one party per session is the primary. The primary owns every
/// asymmetric step of the protocol: it applies public constants, the
/// truncation correction term and the revealed-product term of the secure dot
/// product. All parties execute the same control flow regardless of role; the
/// role only decides which local arithmetic they contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single party that applies the asymmetric correction terms.
    Primary,
    /// Every other party.
    Replica,
}

/// Configuration agreed upon by all parties before the session starts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The number of participating parties.
    pub parties: usize,
    /// The index of the local party (between `0..parties`).
    pub party: usize,
    /// The local party's role; defaults to [`Role::Primary`] for party 0.
    pub role: Role,
    /// The ring modulus all shares live in.
    pub q_field: u64,
    /// The fixed-point radix.
    pub base: u32,
    /// The number of fractional fixed-point digits.
    pub frac: u32,
    /// How long any single blocking wait may take before the in-flight
    /// operation fails with a "peer unresponsive" error.
    pub timeout: Duration,
    /// Whether out-of-range encodings wrap silently or fail fast.
    pub range_policy: RangePolicy,
}

impl SessionConfig {
    /// A config with the default encoding (base 10, 4 fractional digits), a
    /// 60 second timeout and wrapping range policy.
    pub fn new(parties: usize, party: usize, q_field: u64) -> Self {
        SessionConfig {
            parties,
            party,
            role: if party == 0 {
                Role::Primary
            } else {
                Role::Replica
            },
            q_field,
            base: 10,
            frac: 4,
            timeout: Duration::from_secs(60),
            range_policy: RangePolicy::Wrap,
        }
    }

    /// Overrides the fixed-point encoding parameters.
    pub fn with_encoding(mut self, base: u32, frac: u32) -> Self {
        self.base = base;
        self.frac = frac;
        self
    }

    /// Overrides the per-wait timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the range policy.
    pub fn with_range_policy(mut self, policy: RangePolicy) -> Self {
        self.range_policy = policy;
        self
    }
}

/// Generator of fresh operation names, unique within a session.
///
/// All parties derive matching name sequences by issuing their operations in
/// the same control-flow order; there is no negotiation of names on the wire.
/// A party that skips an operation desynchronizes the sequence, which shows
/// up as an unexpected-tag channel error on the next receive.
#[derive(Debug, Default)]
pub struct NamingSeq {
    next: u64,
}

impl NamingSeq {
    /// Returns a fresh, monotonically increasing operation name.
    pub fn next(&mut self) -> String {
        let name = format!("op{}", self.next);
        self.next += 1;
        name
    }
}

/// The digest every party broadcasts at session start to detect
/// configuration disagreements before any share is exchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConfigDigest {
    parties: u64,
    q_field: u64,
    base: u32,
    frac: u32,
    primary: bool,
}

/// Errors raised while establishing a session.
#[derive(Debug)]
pub enum SessionError {
    /// An error occurred while communicating over the channel.
    Channel(channel::Error),
    /// The codec parameters are invalid.
    Codec(CodecError),
    /// The local party index or party count is inconsistent.
    InvalidParty {
        /// The local party index.
        party: usize,
        /// The configured number of parties.
        parties: usize,
    },
    /// A peer runs with a different ring modulus, encoding or party count.
    ConfigMismatch {
        /// The peer whose digest disagrees.
        party: usize,
    },
    /// The parties do not agree on a unique primary.
    RoleConflict {
        /// The number of parties claiming the primary role.
        primaries: usize,
    },
}

impl std::error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Channel(e) => write!(f, "channel error: {e}"),
            SessionError::Codec(e) => write!(f, "codec error: {e}"),
            SessionError::InvalidParty { party, parties } => {
                write!(f, "invalid party index {party} for {parties} parties")
            }
            SessionError::ConfigMismatch { party } => {
                write!(f, "party {party} disagrees on the session configuration")
            }
            SessionError::RoleConflict { primaries } => {
                write!(f, "expected exactly 1 primary party, found {primaries}")
            }
        }
    }
}

impl From<channel::Error> for SessionError {
    fn from(e: channel::Error) -> Self {
        SessionError::Channel(e)
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::Codec(e)
    }
}

/// The per-party protocol context: configuration, codec, transport, the
/// homomorphic-encryption capability and the naming sequence.
pub struct Session<C: Channel, H: HeScheme> {
    pub(crate) cfg: SessionConfig,
    pub(crate) codec: FixedPointCodec,
    pub(crate) comm: MsgChannel<C>,
    pub(crate) he: H,
    names: NamingSeq,
}

impl<C: Channel, H: HeScheme> Session<C, H> {
    /// Establishes a session over the given channel.
    ///
    /// Every party broadcasts a digest of its configuration and verifies that
    /// all digests agree and that exactly one party is primary; any
    /// disagreement aborts the session before a single share is exchanged.
    /// The cancellation token aborts every blocking wait of this session when
    /// triggered, e.g. when another party of the same computation crashed.
    pub async fn establish(
        channel: C,
        he: H,
        cfg: SessionConfig,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        if cfg.parties < 2 || cfg.party >= cfg.parties || channel.participants() != cfg.parties {
            return Err(SessionError::InvalidParty {
                party: cfg.party,
                parties: cfg.parties,
            });
        }
        let codec = FixedPointCodec::new(cfg.q_field, cfg.base, cfg.frac, cfg.range_policy)?;
        let mut comm = MsgChannel::new(channel, cfg.party, cfg.timeout, cancel);

        let own = ConfigDigest {
            parties: cfg.parties as u64,
            q_field: cfg.q_field,
            base: cfg.base,
            frac: cfg.frac,
            primary: cfg.role == Role::Primary,
        };
        comm.broadcast("session_config", &own).await?;
        let mut primaries = usize::from(own.primary);
        for (party, digest) in comm.recv_from_all::<ConfigDigest>("session_config").await? {
            if (digest.parties, digest.q_field, digest.base, digest.frac)
                != (own.parties, own.q_field, own.base, own.frac)
            {
                return Err(SessionError::ConfigMismatch { party });
            }
            primaries += usize::from(digest.primary);
        }
        if primaries != 1 {
            return Err(SessionError::RoleConflict { primaries });
        }
        debug!(
            party = cfg.party,
            parties = cfg.parties,
            role = ?cfg.role,
            "session established"
        );
        Ok(Session {
            cfg,
            codec,
            comm,
            he,
            names: NamingSeq::default(),
        })
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    /// The fixed-point codec of this session.
    pub fn codec(&self) -> &FixedPointCodec {
        &self.codec
    }

    /// The local party's role.
    pub fn role(&self) -> Role {
        self.cfg.role
    }

    /// The local party's index.
    pub fn party(&self) -> usize {
        self.cfg.party
    }

    /// Returns a fresh operation name from the session's naming sequence.
    pub fn next_name(&mut self) -> String {
        self.names.next()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{Session, SessionConfig, SessionError};
    use crate::{channel::SimpleChannel, he::insecure::InsecureHe};

    const Q: u64 = 2_147_483_647;

    #[tokio::test]
    async fn matching_configs_establish() {
        let mut channels = SimpleChannel::channels(2);
        let b = channels.pop().unwrap();
        let a = channels.pop().unwrap();
        let (ra, rb) = tokio::join!(
            Session::establish(
                a,
                InsecureHe::new(Q),
                SessionConfig::new(2, 0, Q),
                CancellationToken::new(),
            ),
            Session::establish(
                b,
                InsecureHe::new(Q),
                SessionConfig::new(2, 1, Q),
                CancellationToken::new(),
            ),
        );
        let (mut sa, sb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(sa.party(), 0);
        assert_eq!(sb.role(), super::Role::Replica);
        assert_eq!(sa.next_name(), "op0");
        assert_eq!(sa.next_name(), "op1");
    }

    #[tokio::test]
    async fn differing_modulus_is_fatal() {
        let mut channels = SimpleChannel::channels(2);
        let b = channels.pop().unwrap();
        let a = channels.pop().unwrap();
        let cfg_b = SessionConfig::new(2, 1, Q - 2).with_timeout(Duration::from_millis(200));
        let (ra, rb) = tokio::join!(
            Session::establish(
                a,
                InsecureHe::new(Q),
                SessionConfig::new(2, 0, Q).with_timeout(Duration::from_millis(200)),
                CancellationToken::new(),
            ),
            Session::establish(b, InsecureHe::new(Q - 2), cfg_b, CancellationToken::new()),
        );
        assert!(matches!(ra, Err(SessionError::ConfigMismatch { party: 1 })));
        assert!(matches!(rb, Err(SessionError::ConfigMismatch { party: 0 })));
    }

    #[tokio::test]
    async fn two_primaries_are_rejected() {
        let mut channels = SimpleChannel::channels(2);
        let b = channels.pop().unwrap();
        let a = channels.pop().unwrap();
        let mut cfg_b = SessionConfig::new(2, 1, Q);
        cfg_b.role = super::Role::Primary;
        let (ra, rb) = tokio::join!(
            Session::establish(
                a,
                InsecureHe::new(Q),
                SessionConfig::new(2, 0, Q),
                CancellationToken::new(),
            ),
            Session::establish(b, InsecureHe::new(Q), cfg_b, CancellationToken::new()),
        );
        assert!(matches!(ra, Err(SessionError::RoleConflict { primaries: 2 })));
        assert!(matches!(rb, Err(SessionError::RoleConflict { primaries: 2 })));
    }
}
