//! In-process transport
//!
//! `MemoryNetwork` is a switchboard that lets many clients in one process
//! meet exactly as they would over a real signaling service: identities are
//! exclusive, dialing an empty identity fails fast, a host that already
//! holds a session turns further dialers away. Used by the integration tests
//! and the CLI simulation.
//!
//! Fault injection:
//! - [`set_unresponsive`](MemoryNetwork::set_unresponsive): dials to an
//!   identity hang until the caller's timeout fires
//! - [`with_connect_delay`](MemoryNetwork::with_connect_delay): every dial
//!   pays a fixed latency before it resolves

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::identity::PeerIdentity;
use super::transport::{
    PeerChannel, PeerEndpoint, PeerMetadata, PeerTransport, TransportError, TransportResult,
};

const INBOX_CAPACITY: usize = 4;
const CHANNEL_BUFFER: usize = 64;
/// Dial log size; the oldest entries are discarded past this
const ATTEMPT_LOG_CAPACITY: usize = 4096;

/// One recorded dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub from: PeerIdentity,
    pub to: PeerIdentity,
}

struct Registration {
    token: u64,
    metadata: PeerMetadata,
    inbox: mpsc::Sender<PeerChannel>,
    busy: Arc<AtomicBool>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerIdentity, Registration>,
    unresponsive: HashSet<PeerIdentity>,
    attempts: VecDeque<ConnectAttempt>,
}

type SharedState = Arc<Mutex<NetworkState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory rendezvous network shared by every client in the process
pub struct MemoryNetwork {
    state: SharedState,
    next_token: AtomicU64,
    connect_delay: Duration,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            next_token: AtomicU64::new(1),
            connect_delay: Duration::ZERO,
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make dials to `identity` hang instead of resolving
    pub fn set_unresponsive(&self, identity: &PeerIdentity, unresponsive: bool) {
        let mut state = lock(&self.state);
        if unresponsive {
            state.unresponsive.insert(identity.clone());
        } else {
            state.unresponsive.remove(identity);
        }
    }

    pub fn is_registered(&self, identity: &PeerIdentity) -> bool {
        lock(&self.state).endpoints.contains_key(identity)
    }

    /// Identities currently held by live endpoints, sorted
    pub fn registered(&self) -> Vec<PeerIdentity> {
        let mut identities: Vec<_> = lock(&self.state).endpoints.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Recent dials in order, up to the last 4096 since creation or
    /// [`clear_attempts`](Self::clear_attempts)
    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        lock(&self.state).attempts.iter().cloned().collect()
    }

    /// Targets dialed by `from`, in order
    pub fn attempts_from(&self, from: &PeerIdentity) -> Vec<PeerIdentity> {
        lock(&self.state)
            .attempts
            .iter()
            .filter(|attempt| &attempt.from == from)
            .map(|attempt| attempt.to.clone())
            .collect()
    }

    pub fn clear_attempts(&self) {
        lock(&self.state).attempts.clear();
    }
}

#[async_trait]
impl PeerTransport for MemoryNetwork {
    async fn open(
        &self,
        identity: PeerIdentity,
        metadata: PeerMetadata,
    ) -> TransportResult<Box<dyn PeerEndpoint>> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        {
            let mut state = lock(&self.state);
            if state.endpoints.contains_key(&identity) {
                debug!(identity = %identity, "identity already claimed");
                return Err(TransportError::IdentityUnavailable(identity));
            }
            state.endpoints.insert(
                identity.clone(),
                Registration {
                    token,
                    metadata,
                    inbox: inbox_tx,
                    busy: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        trace!(identity = %identity, token, "endpoint opened");
        Ok(Box::new(MemoryEndpoint {
            identity,
            token,
            state: self.state.clone(),
            connect_delay: self.connect_delay,
            inbox: inbox_rx,
            closed: false,
        }))
    }
}

enum DialPlan {
    Hang,
    Deliver {
        inbox: mpsc::Sender<PeerChannel>,
        busy: Arc<AtomicBool>,
        host_metadata: PeerMetadata,
    },
}

/// Endpoint handed out by [`MemoryNetwork`]; dropping it releases the identity
pub struct MemoryEndpoint {
    identity: PeerIdentity,
    token: u64,
    state: SharedState,
    connect_delay: Duration,
    inbox: mpsc::Receiver<PeerChannel>,
    closed: bool,
}

impl MemoryEndpoint {
    fn unregister(&mut self) {
        let mut state = lock(&self.state);
        let ours = state
            .endpoints
            .get(&self.identity)
            .is_some_and(|registration| registration.token == self.token);
        if ours {
            state.endpoints.remove(&self.identity);
            trace!(identity = %self.identity, "endpoint released");
        }
    }

    fn plan_dial(&self, target: &PeerIdentity) -> TransportResult<DialPlan> {
        let mut state = lock(&self.state);
        if state.attempts.len() == ATTEMPT_LOG_CAPACITY {
            state.attempts.pop_front();
        }
        state.attempts.push_back(ConnectAttempt {
            from: self.identity.clone(),
            to: target.clone(),
        });

        if state.unresponsive.contains(target) {
            return Ok(DialPlan::Hang);
        }

        let registration = state
            .endpoints
            .get(target)
            .ok_or_else(|| TransportError::PeerUnavailable(target.clone()))?;

        if registration.busy.swap(true, Ordering::SeqCst) {
            return Err(TransportError::PeerBusy(target.clone()));
        }

        Ok(DialPlan::Deliver {
            inbox: registration.inbox.clone(),
            busy: registration.busy.clone(),
            host_metadata: registration.metadata.clone(),
        })
    }
}

#[async_trait]
impl PeerEndpoint for MemoryEndpoint {
    fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    async fn connect(
        &self,
        target: &PeerIdentity,
        metadata: &PeerMetadata,
    ) -> TransportResult<PeerChannel> {
        if self.closed {
            return Err(TransportError::EndpointClosed);
        }
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let (inbox, busy, host_metadata) = match self.plan_dial(target)? {
            DialPlan::Hang => return std::future::pending().await,
            DialPlan::Deliver {
                inbox,
                busy,
                host_metadata,
            } => (inbox, busy, host_metadata),
        };

        let (dialer_end, host_end) = PeerChannel::pair(
            (self.identity.clone(), metadata.clone()),
            (target.clone(), host_metadata),
            CHANNEL_BUFFER,
        );
        // The host stays busy until its accepted end goes away
        let host_end = host_end.on_release(move || busy.store(false, Ordering::SeqCst));

        // A rejected delivery drops host_end, which clears the busy flag again
        inbox.try_send(host_end).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::PeerBusy(target.clone()),
            mpsc::error::TrySendError::Closed(_) => TransportError::PeerUnavailable(target.clone()),
        })?;

        debug!(from = %self.identity, to = %target, "session delivered");
        Ok(dialer_end)
    }

    async fn accept(&mut self) -> TransportResult<PeerChannel> {
        if self.closed {
            return Err(TransportError::EndpointClosed);
        }
        self.inbox.recv().await.ok_or(TransportError::EndpointClosed)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inbox.close();
            self.unregister();
        }
    }
}

impl Drop for MemoryEndpoint {
    fn drop(&mut self) {
        if !self.closed {
            self.unregister();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(id: &str) -> PeerMetadata {
        PeerMetadata {
            peer_id: id.to_string(),
            display_name: id.to_string(),
            interests: vec![],
        }
    }

    fn id(s: &str) -> PeerIdentity {
        PeerIdentity::new(s)
    }

    #[tokio::test]
    async fn test_open_is_exclusive_until_released() {
        let network = MemoryNetwork::new();
        let mut first = network.open(id("slot-1"), metadata("a")).await.unwrap();

        let second = network.open(id("slot-1"), metadata("b")).await;
        assert!(matches!(second, Err(TransportError::IdentityUnavailable(_))));

        first.close().await;
        assert!(!network.is_registered(&id("slot-1")));
        assert!(network.open(id("slot-1"), metadata("b")).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_identity() {
        let network = MemoryNetwork::new();
        let endpoint = network.open(id("slot-2"), metadata("a")).await.unwrap();
        assert!(network.is_registered(&id("slot-2")));
        drop(endpoint);
        assert!(network.registered().is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_empty_identity_fails_fast() {
        let network = MemoryNetwork::new();
        let dialer = network.open(id("dialer"), metadata("a")).await.unwrap();
        let result = dialer.connect(&id("nobody"), &metadata("a")).await;
        assert_eq!(
            result.unwrap_err(),
            TransportError::PeerUnavailable(id("nobody"))
        );
        assert_eq!(network.attempts_from(&id("dialer")), vec![id("nobody")]);
    }

    #[tokio::test]
    async fn test_attempt_log_keeps_most_recent() {
        let network = MemoryNetwork::new();
        let dialer = network.open(id("dialer"), metadata("a")).await.unwrap();
        for n in 0..ATTEMPT_LOG_CAPACITY + 10 {
            let _ = dialer.connect(&id(&format!("slot-{}", n)), &metadata("a")).await;
        }

        let attempts = network.attempts();
        assert_eq!(attempts.len(), ATTEMPT_LOG_CAPACITY);
        assert_eq!(attempts[0].to, id("slot-10"));
        assert_eq!(
            attempts.last().map(|a| a.to.clone()),
            Some(id(&format!("slot-{}", ATTEMPT_LOG_CAPACITY + 9)))
        );
    }

    #[tokio::test]
    async fn test_connect_exchanges_metadata() {
        let network = MemoryNetwork::new();
        let mut host = network.open(id("host"), metadata("h")).await.unwrap();
        let dialer = network.open(id("dialer"), metadata("d")).await.unwrap();

        let mut dialer_end = dialer.connect(&id("host"), &metadata("d")).await.unwrap();
        let mut host_end = host.accept().await.unwrap();

        assert_eq!(dialer_end.remote_metadata().peer_id, "h");
        assert_eq!(host_end.remote_metadata().peer_id, "d");

        dialer_end.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(host_end.recv().await.unwrap(), b"ping".to_vec());
        host_end.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(dialer_end.recv().await.unwrap(), b"pong".to_vec());
    }

    #[tokio::test]
    async fn test_second_dialer_rejected_while_first_active() {
        let network = MemoryNetwork::new();
        let mut host = network.open(id("host"), metadata("h")).await.unwrap();
        let first = network.open(id("first"), metadata("1")).await.unwrap();
        let second = network.open(id("second"), metadata("2")).await.unwrap();

        let mut first_end = first.connect(&id("host"), &metadata("1")).await.unwrap();
        let host_end = host.accept().await.unwrap();

        let rejected = second.connect(&id("host"), &metadata("2")).await;
        assert_eq!(rejected.unwrap_err(), TransportError::PeerBusy(id("host")));

        // First session undisturbed
        host_end.send(b"still here".to_vec()).await.unwrap();
        assert_eq!(first_end.recv().await.unwrap(), b"still here".to_vec());

        // Once the first session ends the host is reachable again
        drop(host_end);
        assert!(second.connect(&id("host"), &metadata("2")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_identity_hangs() {
        let network = MemoryNetwork::new();
        let _host = network.open(id("host"), metadata("h")).await.unwrap();
        let dialer = network.open(id("dialer"), metadata("d")).await.unwrap();
        network.set_unresponsive(&id("host"), true);

        let attempt = tokio::time::timeout(
            Duration::from_secs(2),
            dialer.connect(&id("host"), &metadata("d")),
        )
        .await;
        assert!(attempt.is_err());
    }

    #[tokio::test]
    async fn test_closed_endpoint_refuses_work() {
        let network = MemoryNetwork::new();
        let mut endpoint = network.open(id("me"), metadata("m")).await.unwrap();
        endpoint.close().await;
        assert_eq!(
            endpoint.accept().await.unwrap_err(),
            TransportError::EndpointClosed
        );
        assert_eq!(
            endpoint
                .connect(&id("other"), &metadata("m"))
                .await
                .unwrap_err(),
            TransportError::EndpointClosed
        );
    }
}
