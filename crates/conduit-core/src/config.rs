//! Configuration for the Conduit engine
//!
//! Defaults can be overridden from environment variables or a JSON document.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::CoreError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of trigger hops from a root instance
    #[serde(default = "default_max_trigger_depth")]
    pub max_trigger_depth: u32,

    /// Age after which an unfinished idempotency claim may be taken over
    #[serde(default = "default_claim_ttl_ms")]
    pub idempotency_claim_ttl_ms: u64,

    /// Poll interval while another owner holds an idempotency claim
    #[serde(default = "default_poll_interval_ms")]
    pub idempotency_poll_interval_ms: u64,

    /// Maximum wait for a claim held by another owner
    #[serde(default = "default_wait_timeout_ms")]
    pub idempotency_wait_timeout_ms: u64,

    /// Interval between timeout evaluations of paused instances
    #[serde(default = "default_coordinator_tick_ms")]
    pub coordinator_tick_ms: u64,

    /// Capacity of the inbound event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_trigger_depth() -> u32 {
    8
}

fn default_claim_ttl_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_wait_timeout_ms() -> u64 {
    30_000
}

fn default_coordinator_tick_ms() -> u64 {
    1_000
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_trigger_depth: default_max_trigger_depth(),
            idempotency_claim_ttl_ms: default_claim_ttl_ms(),
            idempotency_poll_interval_ms: default_poll_interval_ms(),
            idempotency_wait_timeout_ms: default_wait_timeout_ms(),
            coordinator_tick_ms: default_coordinator_tick_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, CoreError> {
        let mut config = Self::default();

        override_from_env("CONDUIT_MAX_TRIGGER_DEPTH", &mut config.max_trigger_depth);
        override_from_env(
            "CONDUIT_IDEMPOTENCY_CLAIM_TTL_MS",
            &mut config.idempotency_claim_ttl_ms,
        );
        override_from_env(
            "CONDUIT_IDEMPOTENCY_POLL_INTERVAL_MS",
            &mut config.idempotency_poll_interval_ms,
        );
        override_from_env(
            "CONDUIT_IDEMPOTENCY_WAIT_TIMEOUT_MS",
            &mut config.idempotency_wait_timeout_ms,
        );
        override_from_env("CONDUIT_COORDINATOR_TICK_MS", &mut config.coordinator_tick_ms);
        override_from_env("CONDUIT_EVENT_BUFFER", &mut config.event_buffer);

        config.validate()?;
        info!(
            max_trigger_depth = config.max_trigger_depth,
            coordinator_tick_ms = config.coordinator_tick_ms,
            "Engine configuration loaded"
        );
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.idempotency_poll_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "idempotency_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.coordinator_tick_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "coordinator_tick_ms must be positive".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(CoreError::ConfigurationError(
                "event_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Claim TTL as a duration
    pub fn idempotency_claim_ttl(&self) -> Duration {
        Duration::from_millis(self.idempotency_claim_ttl_ms)
    }

    /// Claim poll interval as a duration
    pub fn idempotency_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idempotency_poll_interval_ms)
    }

    /// Claim wait timeout as a duration
    pub fn idempotency_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.idempotency_wait_timeout_ms)
    }

    /// Coordinator tick as a duration
    pub fn coordinator_tick(&self) -> Duration {
        Duration::from_millis(self.coordinator_tick_ms)
    }
}

fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", name, raw),
        }
    }
}
