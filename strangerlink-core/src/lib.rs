//! Brokerless stranger matching and session lifecycle.
//!
//! - [`core_rendezvous`]: identity scheme, transport contract, slot scanner,
//!   host registrar and the matching orchestrator
//! - [`core_session`]: the per-client session controller actor
//! - [`core_safety`]: classifier seam and non-blocking safety checks

pub mod config;
pub mod core_rendezvous;
pub mod core_safety;
pub mod core_session;
pub mod logging;
pub mod metrics;
pub mod test_utils;

pub use config::Config;
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogLevel};
