//! Metrics facade for rendezvous and session observability
//!
//! Everything records through the `metrics` crate macros. Without an
//! installed recorder the calls are no-ops, so library code records
//! unconditionally and binaries decide whether to export.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

pub const SCAN_ATTEMPTS: &str = "rendezvous.scan.attempts";
pub const SCAN_MATCHED: &str = "rendezvous.scan.matched";
pub const HOST_COLLISIONS: &str = "rendezvous.host.collisions";
pub const ROUNDS: &str = "rendezvous.rounds";
pub const MATCH_DURATION_MS: &str = "rendezvous.match.duration_ms";
pub const MESSAGES_SENT: &str = "session.messages.sent";
pub const MESSAGES_RECEIVED: &str = "session.messages.received";
pub const SAFETY_CHECKS_FAILED: &str = "safety.checks.failed";
pub const SAFETY_FLAGS: &str = "safety.flags";

/// Register descriptions with whatever recorder is installed
pub fn init_metrics() {
    describe_counter!(SCAN_ATTEMPTS, "Outbound connect attempts made while scanning pools");
    describe_counter!(SCAN_MATCHED, "Scans that ended with a connected host");
    describe_counter!(HOST_COLLISIONS, "Slot claims lost to another host");
    describe_counter!(ROUNDS, "Orchestration rounds started");
    describe_histogram!(MATCH_DURATION_MS, "Time from search start to connected, in milliseconds");
    describe_counter!(MESSAGES_SENT, "Chat messages sent to a partner");
    describe_counter!(MESSAGES_RECEIVED, "Chat messages received from a partner");
    describe_counter!(SAFETY_CHECKS_FAILED, "Classifier calls that failed or timed out");
    describe_counter!(SAFETY_FLAGS, "Classifier verdicts that flagged content");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a counter metric with a `pool` label
pub fn record_pool_counter(name: &'static str, pool: &str, value: u64) {
    counter!(name, "pool" => pool.to_string()).increment(value);
}

/// Measures wall time until stopped, recorded in milliseconds
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn stop(self) {
        let elapsed = self.start.elapsed();
        histogram!(self.name).record(elapsed.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        init_metrics();
        record_counter(SCAN_ATTEMPTS, 3);
        record_pool_counter(SCAN_MATCHED, "global", 1);
        Timer::new(MATCH_DURATION_MS).stop();
    }
}
