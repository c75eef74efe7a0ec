//! Stdio entry point for capsule host processes.
//!
//! A host binary only needs a definition:
//!
//! ```rust,no_run
//! use warden_core::CapsuleDefinition;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let definition = CapsuleDefinition::builder("shell").build()?;
//!     warden_wire::host::run_stdio_host(definition).await
//! }
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use warden_config::Config;
use warden_core::CapsuleDefinition;
use warden_telemetry::{LogConfig, LogTarget, TelemetryError, setup_logging};

use crate::server::CapsuleServer;

/// Serve `definition` on stdin/stdout until the caller hangs up.
///
/// Configuration is loaded from the usual layers. Logs go to stderr because
/// stdout carries the wire.
///
/// # Errors
///
/// Returns an error if configuration fails to load or the connection fails.
pub async fn run_stdio_host(definition: impl Into<Arc<CapsuleDefinition>>) -> anyhow::Result<()> {
    let resolved = Config::load(None).context("failed to load warden configuration")?;
    let config = resolved.config;

    let log_config = LogConfig::from(&config.logging).with_target(LogTarget::Stderr);
    match setup_logging(&log_config) {
        Ok(()) => {},
        // The embedding binary may already have installed a subscriber.
        Err(TelemetryError::InitError(e)) => {
            eprintln!("warden host: logging not initialized: {e}");
        },
        Err(e) => return Err(e).context("failed to set up logging"),
    }
    for file in &resolved.loaded_files {
        info!(file = %file, "Loaded config file");
    }

    let server =
        CapsuleServer::from_definition(definition).with_max_line_bytes(config.wire.max_line_bytes);
    let capsule = server.core().definition().name().to_owned();
    info!(capsule = %capsule, "Capsule host serving on stdio");

    let result = server.serve(tokio::io::stdin(), tokio::io::stdout()).await;
    match &result {
        Ok(()) => info!(capsule = %capsule, "Capsule host stopped"),
        Err(e) => warn!(capsule = %capsule, error = %e, "Capsule host connection failed"),
    }
    result.context("capsule host connection failed")
}
