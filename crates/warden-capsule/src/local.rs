//! In-process capsule instance.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use warden_core::{CancellationToken, CapsuleDefinition, CapsuleResult, Metadata, TriggerOutput};

use crate::engine::CapsuleCore;
use crate::instance::CapsuleInstance;
use crate::listeners::{Listener, Subscription};

/// A [`CapsuleInstance`] that calls straight into a [`CapsuleCore`] it owns.
#[derive(Debug)]
pub struct LocalInstance {
    core: CapsuleCore,
}

impl LocalInstance {
    /// Create an instance in the `created` state.
    pub fn new(definition: impl Into<Arc<CapsuleDefinition>>) -> Self {
        Self {
            core: CapsuleCore::new(definition),
        }
    }

    /// The underlying engine.
    #[must_use]
    pub fn core(&self) -> &CapsuleCore {
        &self.core
    }
}

#[async_trait]
impl CapsuleInstance for LocalInstance {
    fn describe(&self) -> CapsuleResult<Metadata> {
        Ok(self.core.describe())
    }

    async fn boot(&self) -> CapsuleResult<()> {
        self.core.boot().await
    }

    async fn shutdown(&self) -> CapsuleResult<()> {
        self.core.shutdown().await
    }

    async fn trigger(
        &self,
        capability: &str,
        operation: &str,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> CapsuleResult<TriggerOutput> {
        self.core.trigger(capability, operation, params, cancel).await
    }

    fn emit(&self, sense: &str, data: Value) -> CapsuleResult<()> {
        self.core.emit(sense, data);
        Ok(())
    }

    fn on_stimulus(&self, listener: Listener) -> CapsuleResult<Subscription> {
        Ok(self.core.on_stimulus(listener))
    }
}
