//! Configuration for the reactive bus facade.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Default reply timeout applied by `observe_*` operations, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Environment variable read by [`BusConfig::from_env`].
pub const DEFAULT_TIMEOUT_ENV: &str = "RX_EVENTBUS_DEFAULT_TIMEOUT_MS";

/// Settings threaded through [`RxBus`](crate::rx::RxBus) at construction.
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use rx_eventbus::BusConfig;
///
/// let config = BusConfig::default().with_default_timeout(Duration::from_secs(5));
/// assert_eq!(config.default_timeout_ms, 5_000);
///
/// let config = BusConfig::from_json(r#"{ "default_timeout_ms": 250 }"#).unwrap();
/// assert_eq!(config.default_timeout(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Timeout for `observe_send`, `observe_reply` and friends when the caller
    /// does not pass one explicitly.
    pub default_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style override of the default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, BusError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| BusError::Config(e.to_string()))?;
        config.validate()
    }

    /// Defaults, overridden by `RX_EVENTBUS_DEFAULT_TIMEOUT_MS` when set.
    pub fn from_env() -> Result<Self, BusError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(DEFAULT_TIMEOUT_ENV) {
            config.default_timeout_ms = raw.trim().parse().map_err(|_| {
                BusError::Config(format!("{} must be an integer, got {:?}", DEFAULT_TIMEOUT_ENV, raw))
            })?;
        }
        config.validate()
    }

    fn validate(self) -> Result<Self, BusError> {
        if self.default_timeout_ms == 0 {
            return Err(BusError::Config(
                "default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }
}
