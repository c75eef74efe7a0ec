//! Configuration struct definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration shared by capsule hosts and the processes that drive
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Wire protocol limits and deadlines.
    pub wire: WireConfig,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingConfig,
}

/// Wire protocol settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Deadline in milliseconds for control requests (`describe`, `boot`,
    /// `shutdown`, `cancel`). Triggers carry no deadline of their own.
    pub request_timeout_ms: u64,
    /// Longest accepted inbound line in bytes. Longer lines are discarded
    /// and reported as protocol errors.
    pub max_line_bytes: usize,
}

impl WireConfig {
    /// [`request_timeout_ms`](Self::request_timeout_ms) as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_line_bytes: 8_388_608,
        }
    }
}

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"`, or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["warden_wire=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
