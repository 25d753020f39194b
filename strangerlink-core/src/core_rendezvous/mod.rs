//! Rendezvous engine
//!
//! Brokerless pairing over a shared identity namespace. Hosts claim slot
//! identities, scanners dial them, and the transport's refusal to hand out
//! the same identity twice is the only coordination between clients.

pub mod identity;
pub mod memory;
pub mod orchestrator;
pub mod registrar;
pub mod scanner;
pub mod transport;

pub use identity::{PeerIdentity, PoolName, RendezvousScheme};
pub use memory::{ConnectAttempt, MemoryEndpoint, MemoryNetwork};
pub use orchestrator::{Match, MatchError, MatchRole, MatchState, MatchingOrchestrator};
pub use registrar::{HostClaim, HostRegistrar};
pub use scanner::{ScanResult, SlotScanner};
pub use transport::{
    connect_within, ConnectionOutcome, PeerChannel, PeerEndpoint, PeerMetadata, PeerTransport,
    TransportError, TransportResult,
};
