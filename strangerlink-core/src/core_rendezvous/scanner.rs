//! Slot scanner
//!
//! Walks every slot of a pool in shuffled order and dials it, one attempt
//! at a time, until some waiting host answers. The shuffle spreads many
//! simultaneous searchers across the pool instead of piling them onto
//! slot 1. Worst case the scan takes `slot_count × timeout`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::identity::{PeerIdentity, PoolName, RendezvousScheme};
use super::transport::{connect_within, ConnectionOutcome, PeerChannel, PeerEndpoint, PeerMetadata};
use crate::metrics::{self, SCAN_ATTEMPTS, SCAN_MATCHED};

#[derive(Debug)]
pub enum ScanResult {
    Matched {
        channel: PeerChannel,
        identity: PeerIdentity,
        slot: u32,
        attempts: u32,
    },
    /// Every slot was tried without finding a host
    Exhausted { attempts: u32 },
}

impl ScanResult {
    pub fn attempts(&self) -> u32 {
        match self {
            ScanResult::Matched { attempts, .. } | ScanResult::Exhausted { attempts } => *attempts,
        }
    }
}

pub struct SlotScanner {
    scheme: RendezvousScheme,
    timeout: Duration,
    rng: Mutex<StdRng>,
}

impl SlotScanner {
    pub fn new(scheme: RendezvousScheme, timeout: Duration) -> Self {
        Self {
            scheme,
            timeout,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Reproducible scan order, for tests and simulations
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Slots `1..=slot_count` in the order the next scan would try them
    pub fn scan_order(&self, slot_count: u32) -> Vec<u32> {
        let mut order: Vec<u32> = (1..=slot_count).collect();
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        order.shuffle(&mut *rng);
        order
    }

    /// Dial each slot of `pool` until a host accepts.
    ///
    /// Each failed attempt is fully resolved (timed out or refused) before
    /// the next one starts, so at most one dial is outstanding.
    pub async fn scan(
        &self,
        endpoint: &dyn PeerEndpoint,
        pool: &PoolName,
        slot_count: u32,
        metadata: &PeerMetadata,
    ) -> ScanResult {
        let order = self.scan_order(slot_count);
        let pool_label = pool.namespace();
        debug!(pool = %pool, slot_count, "scanning pool");

        let mut attempts = 0;
        for slot in order {
            let identity = self.scheme.slot_identity(pool, slot);
            attempts += 1;
            metrics::record_pool_counter(SCAN_ATTEMPTS, &pool_label, 1);

            match connect_within(endpoint, &identity, metadata, self.timeout).await {
                ConnectionOutcome::Matched(channel) => {
                    metrics::record_pool_counter(SCAN_MATCHED, &pool_label, 1);
                    info!(pool = %pool, slot, attempts, "found waiting host");
                    return ScanResult::Matched {
                        channel,
                        identity,
                        slot,
                        attempts,
                    };
                }
                ConnectionOutcome::TimedOut => {
                    trace!(pool = %pool, slot, "slot timed out");
                }
                ConnectionOutcome::IdentityUnavailable => {
                    trace!(pool = %pool, slot, "slot unavailable");
                }
            }
        }

        debug!(pool = %pool, attempts, "pool exhausted");
        ScanResult::Exhausted { attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_rendezvous::memory::MemoryNetwork;
    use crate::core_rendezvous::transport::PeerTransport;
    use proptest::prelude::*;

    fn scheme() -> RendezvousScheme {
        RendezvousScheme::new("test", 1)
    }

    fn metadata(id: &str) -> PeerMetadata {
        PeerMetadata {
            peer_id: id.to_string(),
            display_name: id.to_string(),
            interests: vec![],
        }
    }

    #[test]
    fn test_scan_order_is_a_permutation() {
        let scanner = SlotScanner::new(scheme(), Duration::from_secs(1)).with_seed(7);
        let mut order = scanner.scan_order(25);
        order.sort_unstable();
        assert_eq!(order, (1..=25).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_order_is_reproducible() {
        let a = SlotScanner::new(scheme(), Duration::from_secs(1)).with_seed(99);
        let b = SlotScanner::new(scheme(), Duration::from_secs(1)).with_seed(99);
        assert_eq!(a.scan_order(50), b.scan_order(50));
    }

    #[tokio::test]
    async fn test_scan_stops_at_first_host() {
        let network = MemoryNetwork::new();
        let pool = PoolName::Global;
        let mut host = network
            .open(scheme().slot_identity(&pool, 4), metadata("host"))
            .await
            .unwrap();
        let dialer = network
            .open(scheme().participant_identity("me"), metadata("me"))
            .await
            .unwrap();

        let expected_order = SlotScanner::new(scheme(), Duration::from_secs(1))
            .with_seed(3)
            .scan_order(10);
        let expected_attempts = expected_order.iter().position(|&s| s == 4).unwrap() as u32 + 1;

        let scanner = SlotScanner::new(scheme(), Duration::from_secs(1)).with_seed(3);
        match scanner.scan(&*dialer, &pool, 10, &metadata("me")).await {
            ScanResult::Matched {
                channel,
                slot,
                attempts,
                identity,
            } => {
                assert_eq!(slot, 4);
                assert_eq!(identity, scheme().slot_identity(&pool, 4));
                assert_eq!(attempts, expected_attempts);
                assert_eq!(channel.remote_metadata().peer_id, "host");
            }
            other => panic!("expected a match, got {:?}", other),
        }

        let accepted = host.accept().await.unwrap();
        assert_eq!(accepted.remote_metadata().peer_id, "me");
        assert_eq!(
            network.attempts_from(dialer.identity()).len() as u32,
            expected_attempts
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_slots_bound_latency() {
        let network = MemoryNetwork::new();
        let pool = PoolName::interest("chess").unwrap();
        for slot in 1..=3 {
            network.set_unresponsive(&scheme().slot_identity(&pool, slot), true);
        }
        let dialer = network
            .open(scheme().participant_identity("me"), metadata("me"))
            .await
            .unwrap();

        let timeout = Duration::from_millis(1500);
        let scanner = SlotScanner::new(scheme(), timeout);
        let started = tokio::time::Instant::now();
        let result = scanner.scan(&*dialer, &pool, 3, &metadata("me")).await;

        assert!(matches!(result, ScanResult::Exhausted { attempts: 3 }));
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout * 3);
        assert!(elapsed < timeout * 3 + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_busy_host_is_skipped() {
        let network = MemoryNetwork::new();
        let pool = PoolName::Global;
        let mut host = network
            .open(scheme().slot_identity(&pool, 1), metadata("host"))
            .await
            .unwrap();
        let partner = network
            .open(scheme().participant_identity("partner"), metadata("partner"))
            .await
            .unwrap();
        let _partner_end = partner
            .connect(&scheme().slot_identity(&pool, 1), &metadata("partner"))
            .await
            .unwrap();
        let _host_end = host.accept().await.unwrap();

        let dialer = network
            .open(scheme().participant_identity("late"), metadata("late"))
            .await
            .unwrap();
        let scanner = SlotScanner::new(scheme(), Duration::from_secs(1));
        let result = scanner.scan(&*dialer, &pool, 1, &metadata("late")).await;
        assert!(matches!(result, ScanResult::Exhausted { attempts: 1 }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_empty_pool_exhausts_after_exactly_n_attempts(slot_count in 1u32..60, seed in any::<u64>()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let network = MemoryNetwork::new();
                let dialer = network
                    .open(scheme().participant_identity("me"), metadata("me"))
                    .await
                    .unwrap();
                let scanner = SlotScanner::new(scheme(), Duration::from_secs(1)).with_seed(seed);

                let result = scanner.scan(&*dialer, &PoolName::Global, slot_count, &metadata("me")).await;
                let exhausted = matches!(result, ScanResult::Exhausted { .. });
                prop_assert!(exhausted);
                prop_assert_eq!(result.attempts(), slot_count);

                let mut dialed = network.attempts_from(dialer.identity());
                prop_assert_eq!(dialed.len() as u32, slot_count);
                dialed.sort();
                dialed.dedup();
                prop_assert_eq!(dialed.len() as u32, slot_count);
                Ok(())
            })?;
        }
    }
}
