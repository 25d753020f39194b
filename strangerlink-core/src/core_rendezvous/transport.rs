//! Peer session transport contract
//!
//! The rendezvous engine only needs four things from the real-time stack:
//! claim an identity, dial another identity, learn about inbound sessions,
//! and move bytes over an established channel. Real adapters (WebRTC,
//! relay-backed) and the in-memory [`MemoryNetwork`](super::memory::MemoryNetwork)
//! implement the traits below.
//!
//! The one cross-client synchronization primitive is
//! [`TransportError::IdentityUnavailable`]: a second `open` of a live
//! identity must fail with it, and fail promptly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::identity::PeerIdentity;

/// Errors from transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Another live endpoint already holds this identity
    #[error("Identity already claimed: {0}")]
    IdentityUnavailable(PeerIdentity),

    /// Nothing is listening at the dialed identity
    #[error("No peer at {0}")]
    PeerUnavailable(PeerIdentity),

    /// The dialed endpoint already has an active session
    #[error("Peer {0} is busy")]
    PeerBusy(PeerIdentity),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Endpoint closed")]
    EndpointClosed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Opaque description of a participant presented when a session opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub peer_id: String,
    pub display_name: String,
    pub interests: Vec<String>,
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// One established bidirectional session with a remote peer
///
/// Dropping the channel closes it: the remote side's [`recv`](Self::recv)
/// then yields `None`.
pub struct PeerChannel {
    local: PeerIdentity,
    remote: PeerIdentity,
    remote_metadata: PeerMetadata,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    release: Option<ReleaseHook>,
}

impl PeerChannel {
    /// Create both ends of a session. Each end reports the other's identity
    /// and metadata as its remote.
    pub fn pair(
        a: (PeerIdentity, PeerMetadata),
        b: (PeerIdentity, PeerMetadata),
        buffer: usize,
    ) -> (PeerChannel, PeerChannel) {
        let (a_tx, b_rx) = mpsc::channel(buffer);
        let (b_tx, a_rx) = mpsc::channel(buffer);
        let (a_identity, a_metadata) = a;
        let (b_identity, b_metadata) = b;

        let a_end = PeerChannel {
            local: a_identity.clone(),
            remote: b_identity.clone(),
            remote_metadata: b_metadata,
            outbound: a_tx,
            inbound: a_rx,
            release: None,
        };
        let b_end = PeerChannel {
            local: b_identity,
            remote: a_identity,
            remote_metadata: a_metadata,
            outbound: b_tx,
            inbound: b_rx,
            release: None,
        };
        (a_end, b_end)
    }

    /// Run `hook` exactly once when this end is closed or dropped
    pub fn on_release(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn remote_identity(&self) -> &PeerIdentity {
        &self.remote
    }

    pub fn remote_metadata(&self) -> &PeerMetadata {
        &self.remote_metadata
    }

    /// True while the remote end still holds its side
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub async fn send(&self, payload: Vec<u8>) -> TransportResult<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Send without waiting for buffer space
    pub fn try_send(&self, payload: Vec<u8>) -> TransportResult<()> {
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::ConnectionFailed("outbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::ChannelClosed,
        })
    }

    /// Next payload from the remote side; `None` once it has closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("remote_peer", &self.remote_metadata.peer_id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Result of a single bounded connect attempt
#[derive(Debug)]
pub enum ConnectionOutcome {
    Matched(PeerChannel),
    /// Nothing answered in time, or the attempt failed in transit
    TimedOut,
    /// No host is waiting at the identity, or the host is already taken
    IdentityUnavailable,
}

/// Factory for endpoints bound to an identity
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Claim `identity`. Fails with [`TransportError::IdentityUnavailable`]
    /// while another live endpoint holds it.
    async fn open(
        &self,
        identity: PeerIdentity,
        metadata: PeerMetadata,
    ) -> TransportResult<Box<dyn PeerEndpoint>>;
}

/// A claimed identity on the transport
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    fn identity(&self) -> &PeerIdentity;

    /// Dial `target`, presenting `metadata`
    async fn connect(
        &self,
        target: &PeerIdentity,
        metadata: &PeerMetadata,
    ) -> TransportResult<PeerChannel>;

    /// Wait for the next inbound session. While a previously accepted channel
    /// is alive the transport rejects new dialers with `PeerBusy`.
    async fn accept(&mut self) -> TransportResult<PeerChannel>;

    /// Release the identity; further calls fail with `EndpointClosed`
    async fn close(&mut self);
}

#[async_trait]
impl<T: PeerTransport + ?Sized> PeerTransport for Arc<T> {
    async fn open(
        &self,
        identity: PeerIdentity,
        metadata: PeerMetadata,
    ) -> TransportResult<Box<dyn PeerEndpoint>> {
        (**self).open(identity, metadata).await
    }
}

/// Dial `target` bounded by `timeout`, folding transport errors into the
/// tri-state outcome the scanner works with.
pub async fn connect_within(
    endpoint: &dyn PeerEndpoint,
    target: &PeerIdentity,
    metadata: &PeerMetadata,
    timeout: Duration,
) -> ConnectionOutcome {
    match tokio::time::timeout(timeout, endpoint.connect(target, metadata)).await {
        Ok(Ok(channel)) => ConnectionOutcome::Matched(channel),
        Ok(Err(TransportError::PeerUnavailable(_))) | Ok(Err(TransportError::PeerBusy(_))) => {
            ConnectionOutcome::IdentityUnavailable
        }
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "connect attempt failed");
            ConnectionOutcome::TimedOut
        }
        Err(_) => ConnectionOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metadata(id: &str) -> PeerMetadata {
        PeerMetadata {
            peer_id: id.to_string(),
            display_name: format!("Anon-{}", id),
            interests: vec![],
        }
    }

    fn pair() -> (PeerChannel, PeerChannel) {
        PeerChannel::pair(
            (PeerIdentity::new("a"), metadata("a")),
            (PeerIdentity::new("b"), metadata("b")),
            8,
        )
    }

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = pair();
        assert_eq!(a.remote_identity().as_str(), "b");
        assert_eq!(b.remote_metadata().peer_id, "a");

        a.send(b"hello".to_vec()).await.unwrap();
        b.send(b"hi".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(a.recv().await.unwrap(), b"hi".to_vec());
    }

    #[tokio::test]
    async fn test_drop_closes_remote() {
        let (a, mut b) = pair();
        assert!(b.is_open());
        a.close();
        assert_eq!(b.recv().await, None);
        assert!(!b.is_open());
        assert_eq!(
            b.send(b"late".to_vec()).await,
            Err(TransportError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_release_hook_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (a, _b) = pair();
        let a = a.on_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(a);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
