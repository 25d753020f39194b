//! Configuration management for strangerlink
//!
//! Settings come from three places, in increasing precedence: compiled
//! defaults, a TOML file, and `STRANGERLINK_<SECTION>_<KEY>` environment
//! variables. Every loader finishes with [`Config::validate`].

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::logging::LogLevel;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub matching: MatchingConfig,
    pub safety: SafetyConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Rendezvous pools and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Application namespace placed in front of every rendezvous identity
    pub scheme_prefix: String,

    /// Slot layout version; clients on different versions never meet
    pub scheme_version: u32,

    /// Slots per interest pool
    pub interest_slot_count: u32,

    /// Slots in the global pool
    pub global_slot_count: u32,

    /// Per-attempt connect timeout while scanning
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,

    /// Pause before restarting after losing a hosting race
    #[serde(with = "humantime_serde")]
    pub collision_backoff: Duration,

    /// Distinct slots a host tries before giving the race back to the orchestrator
    pub host_claim_attempts: u32,

    /// How long a host waits for a partner before re-scanning; `None` (written
    /// as `0s`) waits forever
    #[serde(with = "patience")]
    pub host_patience: Option<Duration>,

    /// Upper bound on orchestration rounds; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
}

/// Safety collaborator scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Period between sampled remote frames while connected
    #[serde(with = "humantime_serde")]
    pub frame_scan_interval: Duration,

    /// Bound on every classifier call; a call that overruns counts as safe
    #[serde(with = "humantime_serde")]
    pub classifier_timeout: Duration,

    /// Words flagged by the local blocklist classifier
    pub blocklist: Vec<String>,
}

/// Session controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the command and event queues
    pub event_buffer: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            scheme_prefix: "strangerlink".to_string(),
            scheme_version: 2,
            interest_slot_count: 10,
            global_slot_count: 20,
            scan_timeout: Duration::from_millis(1500),
            collision_backoff: Duration::from_millis(500),
            host_claim_attempts: 1,
            host_patience: Some(Duration::from_secs(30)),
            max_rounds: None,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            frame_scan_interval: Duration::from_secs(20),
            classifier_timeout: Duration::from_secs(10),
            blocklist: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { event_buffer: 256 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

/// Host patience on disk: a humantime duration where `0s` means no bound
mod patience {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(&value.unwrap_or(Duration::ZERO), s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let patience: Duration = humantime_serde::deserialize(d)?;
        Ok(Some(patience).filter(|p| !p.is_zero()))
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// `STRANGERLINK_<SECTION>_<KEY>` lookups over some variable source
struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn raw(&self, section: &str, key: &str) -> (String, Option<String>) {
        let name = format!("STRANGERLINK_{}_{}", section, key);
        let value = (self.lookup)(&name);
        (name, value)
    }

    fn parsed<T>(&self, section: &str, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(section, key) {
            (name, Some(raw)) => parse_var(&name, &raw).map(Some),
            (_, None) => Ok(None),
        }
    }

    fn millis(&self, section: &str, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(section, key)?.map(Duration::from_millis))
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern `STRANGERLINK_<SECTION>_<KEY>`;
    /// durations are given in milliseconds with an `_MS` suffix.
    /// Example: `STRANGERLINK_MATCHING_SCAN_TIMEOUT_MS=2000`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = toml::from_str(&contents)?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let vars = Overrides { lookup };

        let matching = &mut self.matching;
        if let (_, Some(prefix)) = vars.raw("MATCHING", "SCHEME_PREFIX") {
            matching.scheme_prefix = prefix;
        }
        if let Some(version) = vars.parsed("MATCHING", "SCHEME_VERSION")? {
            matching.scheme_version = version;
        }
        if let Some(slots) = vars.parsed("MATCHING", "INTEREST_SLOT_COUNT")? {
            matching.interest_slot_count = slots;
        }
        if let Some(slots) = vars.parsed("MATCHING", "GLOBAL_SLOT_COUNT")? {
            matching.global_slot_count = slots;
        }
        if let Some(timeout) = vars.millis("MATCHING", "SCAN_TIMEOUT_MS")? {
            matching.scan_timeout = timeout;
        }
        if let Some(backoff) = vars.millis("MATCHING", "COLLISION_BACKOFF_MS")? {
            matching.collision_backoff = backoff;
        }
        if let Some(attempts) = vars.parsed("MATCHING", "HOST_CLAIM_ATTEMPTS")? {
            matching.host_claim_attempts = attempts;
        }
        if let Some(patience) = vars.millis("MATCHING", "HOST_PATIENCE_MS")? {
            matching.host_patience = Some(patience).filter(|p| !p.is_zero());
        }
        // 0 lifts the bound
        if let Some(rounds) = vars.parsed::<u32>("MATCHING", "MAX_ROUNDS")? {
            matching.max_rounds = Some(rounds).filter(|r| *r > 0);
        }

        if let Some(interval) = vars.millis("SAFETY", "FRAME_SCAN_INTERVAL_MS")? {
            self.safety.frame_scan_interval = interval;
        }
        if let Some(timeout) = vars.millis("SAFETY", "CLASSIFIER_TIMEOUT_MS")? {
            self.safety.classifier_timeout = timeout;
        }
        if let (_, Some(words)) = vars.raw("SAFETY", "BLOCKLIST") {
            self.safety.blocklist = words
                .split(',')
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect();
        }

        if let Some(buffer) = vars.parsed("SESSION", "EVENT_BUFFER")? {
            self.session.event_buffer = buffer;
        }

        if let (_, Some(level)) = vars.raw("LOGGING", "LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = vars.parsed("LOGGING", "JSON_FORMAT")? {
            self.logging.json_format = json;
        }
        if let Some(timestamp) = vars.parsed("LOGGING", "WITH_TIMESTAMP")? {
            self.logging.with_timestamp = timestamp;
        }
        if let Some(target) = vars.parsed("LOGGING", "WITH_TARGET")? {
            self.logging.with_target = target;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let matching = &self.matching;
        if matching.scheme_prefix.is_empty()
            || !matching
                .scheme_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::Invalid(format!(
                "scheme_prefix must be non-empty ASCII alphanumeric, got '{}'",
                matching.scheme_prefix
            )));
        }
        if matching.interest_slot_count == 0 || matching.global_slot_count == 0 {
            return Err(ConfigError::Invalid(
                "pool slot counts must be greater than 0".to_string(),
            ));
        }
        if matching.scan_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "scan_timeout must be greater than 0".to_string(),
            ));
        }
        if matching.host_claim_attempts == 0 {
            return Err(ConfigError::Invalid(
                "host_claim_attempts must be greater than 0".to_string(),
            ));
        }
        if matching.max_rounds == Some(0) {
            return Err(ConfigError::Invalid(
                "max_rounds must be greater than 0 when set".to_string(),
            ));
        }

        if self.safety.frame_scan_interval.is_zero() || self.safety.classifier_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "safety intervals must be greater than 0".to_string(),
            ));
        }

        if self.session.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer must be greater than 0".to_string(),
            ));
        }

        if self.logging.level.parse::<LogLevel>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        let path = path.as_ref();
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matching.interest_slot_count, 10);
        assert_eq!(config.matching.global_slot_count, 20);
        assert_eq!(config.matching.collision_backoff, Duration::from_millis(500));
        assert_eq!(config.safety.frame_scan_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.matching.global_slot_count = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.matching.scan_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.matching.scheme_prefix = "has-dash".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.matching.max_rounds = Some(0);
        assert!(config.validate().is_err());

        config = Config::default();
        config.session.event_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "WARNING".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_roundtrip_keeps_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strangerlink.toml");

        let mut config = Config::default();
        config.matching.scan_timeout = Duration::from_millis(2200);
        config.matching.host_patience = Some(Duration::from_secs(45));
        config.matching.max_rounds = Some(4);
        config.safety.blocklist = vec!["spam".to_string()];
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);

        config.matching.host_patience = None;
        config.save_to_file(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[matching]\nglobal_slot_count = 5\nscan_timeout = \"2s\"\n")
            .unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.matching.global_slot_count, 5);
        assert_eq!(loaded.matching.scan_timeout, Duration::from_secs(2));
        assert_eq!(loaded.matching.interest_slot_count, 10);
        assert_eq!(loaded.logging, LoggingConfig::default());
    }

    #[test]
    fn test_parse_var_reports_key() {
        let err = parse_var::<u32>("STRANGERLINK_MATCHING_GLOBAL_SLOT_COUNT", "many").unwrap_err();
        assert!(err.to_string().contains("STRANGERLINK_MATCHING_GLOBAL_SLOT_COUNT"));
    }

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_overrides_follow_section_key_names() {
        let mut config = Config::default();
        config
            .apply_overrides(overrides(&[
                ("STRANGERLINK_MATCHING_HOST_CLAIM_ATTEMPTS", "3"),
                ("STRANGERLINK_MATCHING_MAX_ROUNDS", "5"),
                ("STRANGERLINK_MATCHING_HOST_PATIENCE_MS", "0"),
                ("STRANGERLINK_SAFETY_BLOCKLIST", "spam, scam,"),
                ("STRANGERLINK_LOGGING_LEVEL", "debug"),
                ("STRANGERLINK_LOGGING_JSON_FORMAT", "true"),
            ]))
            .unwrap();

        assert_eq!(config.matching.host_claim_attempts, 3);
        assert_eq!(config.matching.max_rounds, Some(5));
        assert_eq!(config.matching.host_patience, None);
        assert_eq!(config.safety.blocklist, vec!["spam".to_string(), "scam".to_string()]);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);

        config
            .apply_overrides(overrides(&[("STRANGERLINK_MATCHING_MAX_ROUNDS", "0")]))
            .unwrap();
        assert_eq!(config.matching.max_rounds, None);
    }

    #[test]
    fn test_bad_override_names_variable() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(overrides(&[("STRANGERLINK_SESSION_EVENT_BUFFER", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref key, .. } if key == "STRANGERLINK_SESSION_EVENT_BUFFER"));
    }

    #[test]
    fn test_unbounded_patience_survives_roundtrip() {
        let mut config = Config::default();
        config.matching.host_patience = None;

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("host_patience = \"0s\""));
        let loaded: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(loaded.matching.host_patience, None);
    }
}
