//! A communication channel used to send/receive shares to/from another party.
//!
//! The [`Channel`] trait is the transport boundary of the crate: anything that
//! can move byte messages between a fixed set of parties can carry the
//! protocol. Every message is tagged with the name of the operation it belongs
//! to, so that independently issued tensor operations are matched to the
//! correct communication round and a desynchronized peer is detected instead
//! of silently corrupting the computation.

use std::{fmt, future::Future, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::mpsc::{Receiver, Sender, channel, error::SendError},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Errors related to sending / receiving / (de-)serializing tagged messages.
#[derive(Debug)]
pub struct Error {
    /// The operation name during which the error occurred.
    pub tag: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel error during {:?}: {:?}", self.tag, self.reason)
    }
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the channel.
    RecvError(String),
    /// The (serialized) message could not be sent over the channel.
    SendError(String),
    /// The message could not be (de-)serialized.
    SerdeError(String),
    /// The received message belongs to a different operation, i.e. the peer
    /// issued its operations in a different order.
    UnexpectedTag {
        /// The tag this party was waiting for.
        expected: String,
        /// The tag the peer actually sent.
        actual: String,
    },
    /// The peer did not supply its message within the session timeout.
    PeerTimeout(Duration),
    /// The session was aborted while waiting for the message.
    Cancelled,
}

impl Error {
    /// Whether the error is a "peer unresponsive" timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.reason, ErrorKind::PeerTimeout(_))
    }

    /// Whether the error was caused by a session abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.reason, ErrorKind::Cancelled)
    }
}

/// A communication channel used to send/receive messages to/from another party.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index (must be between `0..participants`).
    fn send_bytes_to(
        &mut self,
        party: usize,
        msg: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits a message from the party with the given index (must be between `0..participants`).
    fn recv_bytes_from(
        &mut self,
        party: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>> + Send;

    /// The number of parties this channel connects (including the local one).
    fn participants(&self) -> usize;
}

/// A wrapper around [`Channel`] that (de-)serializes messages and enforces the
/// tagging discipline: messages are matched by operation name, with a
/// session-scoped timeout and cancellation signal observed on every receive.
#[derive(Debug)]
pub(crate) struct MsgChannel<C: Channel> {
    channel: C,
    own_party: usize,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<C: Channel> MsgChannel<C> {
    pub(crate) fn new(
        channel: C,
        own_party: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        MsgChannel {
            channel,
            own_party,
            timeout,
            cancel,
        }
    }

    pub(crate) fn participants(&self) -> usize {
        self.channel.participants()
    }

    /// The indices of all other parties, in ascending order.
    pub(crate) fn other_parties(&self) -> impl Iterator<Item = usize> + use<C> {
        let own = self.own_party;
        (0..self.participants()).filter(move |&p| p != own)
    }

    fn serialize(tag: &str, msg: &impl Serialize) -> Result<Vec<u8>, Error> {
        let payload = bincode::serialize(msg).map_err(|e| Error {
            tag: tag.to_string(),
            reason: ErrorKind::SerdeError(format!("{e:?}")),
        })?;
        bincode::serialize(&(tag, payload)).map_err(|e| Error {
            tag: tag.to_string(),
            reason: ErrorKind::SerdeError(format!("{e:?}")),
        })
    }

    /// Serializes and sends a message to the given party under `tag`.
    pub(crate) async fn send_to(
        &mut self,
        party: usize,
        tag: &str,
        msg: &impl Serialize,
    ) -> Result<(), Error> {
        let msg = Self::serialize(tag, msg)?;
        self.channel
            .send_bytes_to(party, msg)
            .await
            .map_err(|e| Error {
                tag: tag.to_string(),
                reason: ErrorKind::SendError(format!("{e:?}")),
            })
    }

    /// Sends a message to every other party under `tag`.
    pub(crate) async fn broadcast(&mut self, tag: &str, msg: &impl Serialize) -> Result<(), Error> {
        let msg = Self::serialize(tag, msg)?;
        for party in self.other_parties().collect::<Vec<_>>() {
            self.channel
                .send_bytes_to(party, msg.clone())
                .await
                .map_err(|e| Error {
                    tag: tag.to_string(),
                    reason: ErrorKind::SendError(format!("{e:?}")),
                })?;
        }
        Ok(())
    }

    /// Receives and deserializes a message from the given party, verifying
    /// that it carries the expected `tag`.
    pub(crate) async fn recv_from<T: DeserializeOwned>(
        &mut self,
        party: usize,
        tag: &str,
    ) -> Result<T, Error> {
        let recv = self.channel.recv_bytes_from(party);
        let msg = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(Error {
                    tag: tag.to_string(),
                    reason: ErrorKind::Cancelled,
                });
            }
            msg = timeout(self.timeout, recv) => match msg {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    return Err(Error {
                        tag: tag.to_string(),
                        reason: ErrorKind::RecvError(format!("{e:?}")),
                    });
                }
                Err(_) => {
                    return Err(Error {
                        tag: tag.to_string(),
                        reason: ErrorKind::PeerTimeout(self.timeout),
                    });
                }
            },
        };
        let (actual, payload): (String, Vec<u8>) = bincode::deserialize(&msg).map_err(|e| Error {
            tag: tag.to_string(),
            reason: ErrorKind::SerdeError(format!("{e:?}")),
        })?;
        if actual != tag {
            return Err(Error {
                tag: tag.to_string(),
                reason: ErrorKind::UnexpectedTag {
                    expected: tag.to_string(),
                    actual,
                },
            });
        }
        bincode::deserialize(&payload).map_err(|e| Error {
            tag: tag.to_string(),
            reason: ErrorKind::SerdeError(format!("{e:?}")),
        })
    }

    /// Receives one message per other party under `tag`, in ascending party
    /// order, returning `(party, message)` pairs.
    pub(crate) async fn recv_from_all<T: DeserializeOwned>(
        &mut self,
        tag: &str,
    ) -> Result<Vec<(usize, T)>, Error> {
        let mut msgs = Vec::with_capacity(self.participants().saturating_sub(1));
        for party in self.other_parties().collect::<Vec<_>>() {
            let msg = self.recv_from(party, tag).await?;
            msgs.push((party, msg));
        }
        Ok(msgs)
    }
}

/// A simple in-memory channel using [`Sender`] and [`Receiver`], for tests and
/// single-process simulations.
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Receiver<Vec<u8>>>>,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels = vec![];
        for _ in 0..parties {
            let mut s = vec![];
            let mut r = vec![];
            for _ in 0..parties {
                s.push(None);
                r.push(None);
            }
            channels.push(SimpleChannel { s, r });
        }
        for a in 0..parties {
            for b in 0..parties {
                if a == b {
                    continue;
                }
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                let (send_b_to_a, recv_b_to_a) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].s[a] = Some(send_b_to_a);
                channels[a].r[b] = Some(recv_b_to_a);
                channels[b].r[a] = Some(recv_a_to_b);
            }
        }
        channels
    }
}

/// The error raised by `recv` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum AsyncRecvError {
    /// The channel has been closed.
    Closed,
}

impl Channel for SimpleChannel {
    type SendError = SendError<Vec<u8>>;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&mut self, p: usize, msg: Vec<u8>) -> Result<(), SendError<Vec<u8>>> {
        self.s[p]
            .as_ref()
            .unwrap_or_else(|| panic!("No sender for party {p}"))
            .send(msg)
            .await
    }

    async fn recv_bytes_from(&mut self, p: usize) -> Result<Vec<u8>, AsyncRecvError> {
        self.r[p]
            .as_mut()
            .unwrap_or_else(|| panic!("No receiver for party {p}"))
            .recv()
            .await
            .ok_or(AsyncRecvError::Closed)
    }

    fn participants(&self) -> usize {
        self.s.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{ErrorKind, MsgChannel, SimpleChannel};

    fn msg_channels(timeout: Duration) -> (MsgChannel<SimpleChannel>, MsgChannel<SimpleChannel>) {
        let mut channels = SimpleChannel::channels(2);
        let b = channels.pop().unwrap();
        let a = channels.pop().unwrap();
        (
            MsgChannel::new(a, 0, timeout, CancellationToken::new()),
            MsgChannel::new(b, 1, timeout, CancellationToken::new()),
        )
    }

    #[tokio::test]
    async fn tagged_send_and_recv() {
        let (mut a, mut b) = msg_channels(Duration::from_secs(1));
        a.send_to(1, "op0", &vec![1u64, 2, 3]).await.unwrap();
        let msg: Vec<u64> = b.recv_from(0, "op0").await.unwrap();
        assert_eq!(msg, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn tag_mismatch_is_detected() {
        let (mut a, mut b) = msg_channels(Duration::from_secs(1));
        a.send_to(1, "op0", &0u32).await.unwrap();
        let err = b.recv_from::<u32>(0, "op1").await.unwrap_err();
        assert!(matches!(err.reason, ErrorKind::UnexpectedTag { .. }));
    }

    #[tokio::test]
    async fn recv_times_out_without_peer() {
        let (_a, mut b) = msg_channels(Duration::from_millis(20));
        let err = b.recv_from::<u32>(0, "op0").await.unwrap_err();
        assert!(err.is_timeout());
    }
}
