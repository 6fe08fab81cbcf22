//! Monitoring module for Conduit services.
//!
//! Structured logging through `tracing`, with JSON output for log
//! aggregation or pretty output for development.

use serde::{Deserialize, Serialize};
use std::env;

pub mod logging;

pub use logging::{init_logging, LogExt};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info,conduit_core=debug"); RUST_LOG takes precedence
    pub log_filter: String,
    /// Emit JSON instead of pretty logs
    pub enable_json_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            service_name: "conduit".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
        }
    }
}

impl LoggingConfig {
    /// Read `SERVICE_NAME`, `LOG_LEVEL` and `LOG_FORMAT` (`json` or `pretty`)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = env::var("SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            config.log_filter = level;
        }
        if let Ok(format) = env::var("LOG_FORMAT") {
            match format.to_lowercase().as_str() {
                "json" => config.enable_json_logging = true,
                "pretty" | "text" => config.enable_json_logging = false,
                // Logging is not up yet, so this cannot go through tracing
                _ => eprintln!("Invalid LOG_FORMAT value: {}", format),
            }
        }

        config
    }
}
