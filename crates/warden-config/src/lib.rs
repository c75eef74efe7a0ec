#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Layered configuration for warden capsule hosts and clients.
//!
//! # Usage
//!
//! ```rust,no_run
//! use warden_config::Config;
//!
//! // defaults → ~/.warden/config.toml → WARDEN_* env fallbacks
//! let resolved = Config::load(None).unwrap();
//! println!("request timeout: {}ms", resolved.config.wire.request_timeout_ms);
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Explicit file** passed to [`Config::load`]
//! 2. **User** (`~/.warden/config.toml`)
//! 3. **Environment variables** (`WARDEN_*`), fallback only
//! 4. **Embedded defaults** (`defaults.toml` compiled into binary)
//!
//! This crate has no dependencies on other warden crates.

/// Environment variable fallback resolution.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layered configuration merging with source tracking.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

use std::collections::HashMap;
use std::path::Path;

pub use error::{ConfigError, ConfigResult};
pub use loader::ResolvedConfig;
pub use merge::ConfigLayer;
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain, reading `WARDEN_*`
    /// variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<ResolvedConfig> {
        loader::load(explicit, None, &env::collect_env_vars())
    }

    /// Load configuration with an explicit warden home directory and
    /// environment snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load_with(
        explicit: Option<&Path>,
        warden_home: &Path,
        env_vars: &HashMap<String, String>,
    ) -> ConfigResult<ResolvedConfig> {
        loader::load(explicit, Some(warden_home), env_vars)
    }
}
