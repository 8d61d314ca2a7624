//! Session configuration
//!
//! Defaults suit an interactive app talking to a single peripheral. Values can
//! be overridden from a file and from `INGELIGHT_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default connect timeout (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default timeout for read, write-with-response, discovery and disconnect (milliseconds)
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `None` waits for the adapter indefinitely
    pub connect_timeout_ms: Option<u64>,
    /// `None` waits for the adapter indefinitely
    pub operation_timeout_ms: Option<u64>,
    /// Stop an active scan before connecting
    pub stop_scan_on_connect: bool,
    /// Discover the characteristics of every service once services are known
    pub auto_discover_characteristics: bool,
    /// Log filter level for the binary (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
            operation_timeout_ms: Some(DEFAULT_OPERATION_TIMEOUT_MS),
            stop_scan_on_connect: true,
            auto_discover_characteristics: true,
            log_level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// No timeouts: every operation waits for its adapter event
    pub fn unbounded() -> Self {
        Self {
            connect_timeout_ms: None,
            operation_timeout_ms: None,
            ..Self::default()
        }
    }

    /// Load from an optional file (any format the `config` crate detects from
    /// its extension) overlaid with `INGELIGHT_*` environment variables
    #[cfg(feature = "config-file")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, crate::IngeLightError> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("INGELIGHT"))
            .build()
            .map_err(|e| crate::IngeLightError::Configuration(e.to_string()))?;

        let config: SessionConfig = settings
            .try_deserialize()
            .map_err(|e| crate::IngeLightError::Configuration(e.to_string()))?;
        tracing::debug!("Loaded session config: {:?}", config);
        Ok(config)
    }
}
