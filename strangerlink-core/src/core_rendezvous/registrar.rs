//! Host registrar
//!
//! Claims a slot identity and waits for a scanner to dial it. Exclusivity
//! comes entirely from the transport: only one live endpoint can hold an
//! identity, so losing the `open` race is how a host learns that someone
//! else got the slot first.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::identity::{PeerIdentity, PoolName, RendezvousScheme};
use super::transport::{
    PeerChannel, PeerEndpoint, PeerMetadata, PeerTransport, TransportError, TransportResult,
};
use crate::metrics::{self, HOST_COLLISIONS};

/// A slot this client holds while waiting for a partner
pub struct HostClaim {
    endpoint: Box<dyn PeerEndpoint>,
    pool: PoolName,
    slot: u32,
}

impl HostClaim {
    pub fn pool(&self) -> &PoolName {
        &self.pool
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn identity(&self) -> &PeerIdentity {
        self.endpoint.identity()
    }

    /// Wait for the first inbound session.
    ///
    /// Returns `Ok(None)` when `patience` runs out first; a zero patience
    /// waits forever. The endpoint stays registered after a partner arrives,
    /// which keeps later dialers bouncing off with `PeerBusy`.
    pub async fn wait_for_partner(
        &mut self,
        patience: Option<Duration>,
    ) -> TransportResult<Option<PeerChannel>> {
        match patience.filter(|p| !p.is_zero()) {
            Some(patience) => match tokio::time::timeout(patience, self.endpoint.accept()).await {
                Ok(accepted) => accepted.map(Some),
                Err(_) => Ok(None),
            },
            None => self.endpoint.accept().await.map(Some),
        }
    }

    pub fn into_endpoint(self) -> Box<dyn PeerEndpoint> {
        self.endpoint
    }

    /// Give the slot back
    pub async fn relinquish(mut self) {
        self.endpoint.close().await;
    }
}

pub struct HostRegistrar {
    scheme: RendezvousScheme,
    claim_attempts: u32,
    rng: Mutex<StdRng>,
}

impl HostRegistrar {
    pub fn new(scheme: RendezvousScheme, claim_attempts: u32) -> Self {
        Self {
            scheme,
            claim_attempts: claim_attempts.max(1),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    fn candidate_slots(&self, slot_count: u32) -> Vec<u32> {
        let mut slots: Vec<u32> = (1..=slot_count).collect();
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.shuffle(&mut *rng);
        slots.truncate(self.claim_attempts as usize);
        slots
    }

    /// Claim a random slot of `pool`, moving on to a different slot after
    /// each lost race. Once `claim_attempts` slots are lost the last
    /// `IdentityUnavailable` is returned for the caller's retry policy.
    pub async fn claim(
        &self,
        transport: &dyn PeerTransport,
        pool: &PoolName,
        slot_count: u32,
        metadata: &PeerMetadata,
    ) -> TransportResult<HostClaim> {
        let mut last_collision = None;
        for slot in self.candidate_slots(slot_count) {
            match self.claim_slot(transport, pool, slot, metadata).await {
                Ok(claim) => return Ok(claim),
                Err(TransportError::IdentityUnavailable(identity)) => {
                    last_collision = Some(identity);
                }
                Err(e) => return Err(e),
            }
        }

        let identity = last_collision
            .unwrap_or_else(|| self.scheme.slot_identity(pool, 1));
        Err(TransportError::IdentityUnavailable(identity))
    }

    /// Claim one specific slot
    pub async fn claim_slot(
        &self,
        transport: &dyn PeerTransport,
        pool: &PoolName,
        slot: u32,
        metadata: &PeerMetadata,
    ) -> TransportResult<HostClaim> {
        let identity = self.scheme.slot_identity(pool, slot);
        match transport.open(identity.clone(), metadata.clone()).await {
            Ok(endpoint) => {
                info!(pool = %pool, slot, "hosting slot");
                Ok(HostClaim {
                    endpoint,
                    pool: pool.clone(),
                    slot,
                })
            }
            Err(TransportError::IdentityUnavailable(taken)) => {
                metrics::record_pool_counter(HOST_COLLISIONS, &pool.namespace(), 1);
                debug!(identity = %taken, "slot already hosted");
                Err(TransportError::IdentityUnavailable(taken))
            }
            Err(e) => Err(e),
        }
    }
}
