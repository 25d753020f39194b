//! Rendezvous identity scheme
//!
//! Maps `(pool, slot)` to the globally addressable name a host claims and a
//! scanner dials. Pure and deterministic: two clients that agree on prefix
//! and version derive the same identity for the same slot.
//!
//! ```text
//! <prefix>-v<version>-global-<slot>          global pool
//! <prefix>-v<version>-i-<slug>-<slot>        interest pool
//! <prefix>-v<version>-peer-<local_id>        a participant's scanning identity
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::MatchingConfig;

/// Name under which an endpoint is reachable on the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A partition of the identity space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolName {
    Global,
    /// Holds the normalized slug, never the raw interest text
    Interest(String),
}

impl PoolName {
    /// Pool for a single interest; `None` when nothing usable is left after trimming
    pub fn interest(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let slug = trimmed
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        Some(PoolName::Interest(slug))
    }

    /// Interest pool for a participant: derived from the first declared interest
    pub fn for_interests(interests: &[String]) -> Option<Self> {
        interests.iter().find_map(|raw| Self::interest(raw))
    }

    pub fn is_global(&self) -> bool {
        matches!(self, PoolName::Global)
    }

    /// Identity segment for this pool
    pub fn namespace(&self) -> String {
        match self {
            PoolName::Global => "global".to_string(),
            PoolName::Interest(slug) => format!("i-{}", slug),
        }
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace())
    }
}

/// Versioned naming convention shared by every client of a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousScheme {
    prefix: String,
    version: u32,
}

impl RendezvousScheme {
    pub fn new(prefix: impl Into<String>, version: u32) -> Self {
        Self {
            prefix: prefix.into(),
            version,
        }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.scheme_prefix.clone(), config.scheme_version)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Identity of slot `slot` in `pool`
    pub fn slot_identity(&self, pool: &PoolName, slot: u32) -> PeerIdentity {
        PeerIdentity(format!(
            "{}-v{}-{}-{}",
            self.prefix,
            self.version,
            pool.namespace(),
            slot
        ))
    }

    /// Identity a participant scans from; never equal to any slot identity
    pub fn participant_identity(&self, local_id: &str) -> PeerIdentity {
        PeerIdentity(format!("{}-v{}-peer-{}", self.prefix, self.version, local_id))
    }
}
