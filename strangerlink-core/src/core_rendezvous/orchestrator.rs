//! Matching orchestrator
//!
//! Runs rounds of interest scan, global scan, then host fallback until some
//! peer connects. A lost hosting race is expected under load and only costs
//! a backoff and a fresh round.
//!
//! ```text
//! Idle -> Scanning(interest) -> Scanning(global) -> Hosting(global) -> Connected
//!               ^                                        |
//!               +--------------- Backoff <---------------+  (collision)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::identity::{PoolName, RendezvousScheme};
use super::registrar::HostRegistrar;
use super::scanner::{ScanResult, SlotScanner};
use super::transport::{PeerChannel, PeerEndpoint, PeerMetadata, PeerTransport, TransportError};
use crate::config::MatchingConfig;
use crate::metrics::{self, Timer, MATCH_DURATION_MS, ROUNDS};

/// Observable orchestrator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchState {
    Idle,
    Scanning { pool: PoolName },
    Hosting { pool: PoolName, slot: u32 },
    /// Waiting out a collision before starting the next round
    Backoff { round: u32 },
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRole {
    /// We dialed a waiting host
    Scanner,
    /// A scanner dialed our slot
    Host,
}

/// A live pairing handed to the session layer.
///
/// `endpoint` must be kept for as long as the channel is in use: for a host
/// it is what keeps the slot claimed and further dialers rejected.
pub struct Match {
    pub channel: PeerChannel,
    pub endpoint: Box<dyn PeerEndpoint>,
    pub role: MatchRole,
    pub pool: PoolName,
    pub rounds: u32,
}

impl Match {
    /// Participant id the partner presented
    pub fn remote_peer(&self) -> &str {
        &self.channel.remote_metadata().peer_id
    }
}

impl fmt::Debug for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Match")
            .field("channel", &self.channel)
            .field("endpoint", self.endpoint.identity())
            .field("role", &self.role)
            .field("pool", &self.pool)
            .field("rounds", &self.rounds)
            .finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("A search is already in progress")]
    AlreadySearching,

    #[error("No match after {0} rounds")]
    RoundsExhausted(u32),
}

enum RoundOutcome {
    Matched(Match),
    Collision,
    PatienceElapsed,
    Failed(TransportError),
}

/// Releases the in-flight flag when a search ends or its future is dropped
struct SearchGuard<'a> {
    searching: &'a AtomicBool,
    state: &'a watch::Sender<MatchState>,
}

impl Drop for SearchGuard<'_> {
    fn drop(&mut self) {
        self.searching.store(false, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if matches!(state, MatchState::Connected | MatchState::Idle) {
                false
            } else {
                *state = MatchState::Idle;
                true
            }
        });
    }
}

pub struct MatchingOrchestrator {
    transport: Arc<dyn PeerTransport>,
    scheme: RendezvousScheme,
    scanner: SlotScanner,
    registrar: HostRegistrar,
    interest_slots: u32,
    global_slots: u32,
    collision_backoff: Duration,
    host_patience: Option<Duration>,
    max_rounds: Option<u32>,
    searching: AtomicBool,
    state: watch::Sender<MatchState>,
}

impl MatchingOrchestrator {
    pub fn new(transport: Arc<dyn PeerTransport>, config: &MatchingConfig) -> Self {
        let scheme = RendezvousScheme::from_config(config);
        let (state, _) = watch::channel(MatchState::Idle);
        Self {
            transport,
            scanner: SlotScanner::new(scheme.clone(), config.scan_timeout),
            registrar: HostRegistrar::new(scheme.clone(), config.host_claim_attempts),
            scheme,
            interest_slots: config.interest_slot_count,
            global_slots: config.global_slot_count,
            collision_backoff: config.collision_backoff,
            host_patience: config.host_patience,
            max_rounds: config.max_rounds,
            searching: AtomicBool::new(false),
            state,
        }
    }

    /// Deterministic slot choices for tests and simulations
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            scanner: self.scanner.with_seed(seed),
            registrar: self.registrar.with_seed(seed.wrapping_add(1)),
            ..self
        }
    }

    pub fn scheme(&self) -> &RendezvousScheme {
        &self.scheme
    }

    pub fn subscribe(&self) -> watch::Receiver<MatchState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> MatchState {
        self.state.borrow().clone()
    }

    pub fn is_searching(&self) -> bool {
        self.searching.load(Ordering::SeqCst)
    }

    fn publish(&self, state: MatchState) {
        self.state.send_replace(state);
    }

    fn begin(&self) -> Result<SearchGuard<'_>, MatchError> {
        self.searching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| MatchError::AlreadySearching)?;
        Ok(SearchGuard {
            searching: &self.searching,
            state: &self.state,
        })
    }

    /// Search until a peer connects.
    ///
    /// Dropping the returned future cancels the search and releases every
    /// identity it held.
    pub async fn find_match(&self, metadata: &PeerMetadata) -> Result<Match, MatchError> {
        let _guard = self.begin()?;
        let timer = Timer::new(MATCH_DURATION_MS);
        let interest_pool = PoolName::for_interests(&metadata.interests);
        info!(peer = %metadata.peer_id, interest_pool = ?interest_pool, "starting match search");

        let mut round = 0;
        loop {
            if self.max_rounds.is_some_and(|max| round >= max) {
                warn!(rounds = round, "giving up search");
                return Err(MatchError::RoundsExhausted(round));
            }
            round += 1;
            metrics::record_counter(ROUNDS, 1);

            match self.run_round(metadata, interest_pool.as_ref(), round).await {
                RoundOutcome::Matched(found) => {
                    self.publish(MatchState::Connected);
                    timer.stop();
                    info!(
                        role = ?found.role,
                        pool = %found.pool,
                        rounds = round,
                        remote = %found.channel.remote_identity(),
                        "matched"
                    );
                    return Ok(found);
                }
                RoundOutcome::PatienceElapsed => {
                    debug!(round, "nobody dialed our slot, starting over");
                }
                RoundOutcome::Collision => {
                    debug!(round, backoff = ?self.collision_backoff, "identity collision, backing off");
                    self.publish(MatchState::Backoff { round });
                    tokio::time::sleep(self.collision_backoff).await;
                }
                RoundOutcome::Failed(e) => {
                    warn!(round, error = %e, "round failed, backing off");
                    self.publish(MatchState::Backoff { round });
                    tokio::time::sleep(self.collision_backoff).await;
                }
            }
        }
    }

    async fn run_round(
        &self,
        metadata: &PeerMetadata,
        interest_pool: Option<&PoolName>,
        round: u32,
    ) -> RoundOutcome {
        let identity = self.scheme.participant_identity(&metadata.peer_id);
        let mut endpoint = match self.transport.open(identity, metadata.clone()).await {
            Ok(endpoint) => endpoint,
            Err(TransportError::IdentityUnavailable(_)) => return RoundOutcome::Collision,
            Err(e) => return RoundOutcome::Failed(e),
        };

        let pools = interest_pool
            .map(|pool| (pool.clone(), self.interest_slots))
            .into_iter()
            .chain(std::iter::once((PoolName::Global, self.global_slots)));

        for (pool, slot_count) in pools {
            self.publish(MatchState::Scanning { pool: pool.clone() });
            if let ScanResult::Matched { channel, .. } =
                self.scanner.scan(&*endpoint, &pool, slot_count, metadata).await
            {
                return RoundOutcome::Matched(Match {
                    channel,
                    endpoint,
                    role: MatchRole::Scanner,
                    pool,
                    rounds: round,
                });
            }
        }
        endpoint.close().await;

        let pool = PoolName::Global;
        let mut claim = match self
            .registrar
            .claim(&*self.transport, &pool, self.global_slots, metadata)
            .await
        {
            Ok(claim) => claim,
            Err(TransportError::IdentityUnavailable(_)) => return RoundOutcome::Collision,
            Err(e) => return RoundOutcome::Failed(e),
        };
        self.publish(MatchState::Hosting {
            pool: pool.clone(),
            slot: claim.slot(),
        });

        match claim.wait_for_partner(self.host_patience).await {
            Ok(Some(channel)) => RoundOutcome::Matched(Match {
                channel,
                endpoint: claim.into_endpoint(),
                role: MatchRole::Host,
                pool,
                rounds: round,
            }),
            Ok(None) => {
                claim.relinquish().await;
                RoundOutcome::PatienceElapsed
            }
            Err(e) => RoundOutcome::Failed(e),
        }
    }
}
