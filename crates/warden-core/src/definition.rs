//! Capsule definitions: the immutable description an instance runs.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::Capability;
use crate::context::LifecycleContext;
use crate::error::{CapsuleError, CapsuleResult};
use crate::metadata::Metadata;
use crate::middleware::{Middleware, SharedMiddleware};

/// A boot or shutdown hook.
pub type LifecycleHook =
    Arc<dyn Fn(LifecycleContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Introspection entry for a sense the capsule may emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenseDescriptor {
    /// Sense name.
    pub name: String,
    /// Human-readable documentation.
    pub docs: String,
    /// Human-readable payload signature.
    pub signature: String,
}

impl SenseDescriptor {
    /// Create a sense descriptor.
    pub fn new(
        name: impl Into<String>,
        docs: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            docs: docs.into(),
            signature: signature.into(),
        }
    }
}

/// Everything an instance needs to run: capabilities, capsule-level
/// middleware, declared senses and lifecycle hooks.
///
/// Built once through [`CapsuleDefinition::builder`] and shared read-only
/// by every instance created from it.
pub struct CapsuleDefinition {
    name: String,
    docs: Option<String>,
    capabilities: Vec<Capability>,
    senses: Vec<SenseDescriptor>,
    middleware: Vec<SharedMiddleware>,
    on_boot: Option<LifecycleHook>,
    on_shutdown: Option<LifecycleHook>,
}

impl CapsuleDefinition {
    /// Start building a definition.
    pub fn builder(name: impl Into<String>) -> CapsuleDefinitionBuilder {
        CapsuleDefinitionBuilder {
            name: name.into(),
            docs: None,
            capabilities: Vec::new(),
            senses: Vec::new(),
            middleware: Vec::new(),
            on_boot: None,
            on_shutdown: None,
        }
    }

    /// Capsule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capsule documentation.
    #[must_use]
    pub fn docs(&self) -> Option<&str> {
        self.docs.as_deref()
    }

    /// Capabilities in declaration order.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Look up a capability by name.
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name() == name)
    }

    /// Declared senses.
    #[must_use]
    pub fn senses(&self) -> &[SenseDescriptor] {
        &self.senses
    }

    /// Capsule-level middleware, in the order it runs.
    #[must_use]
    pub fn middleware(&self) -> &[SharedMiddleware] {
        &self.middleware
    }

    /// The boot hook, if one was declared.
    #[must_use]
    pub fn boot_hook(&self) -> Option<&LifecycleHook> {
        self.on_boot.as_ref()
    }

    /// The shutdown hook, if one was declared.
    #[must_use]
    pub fn shutdown_hook(&self) -> Option<&LifecycleHook> {
        self.on_shutdown.as_ref()
    }

    /// Introspection payload for an instance with the given id.
    #[must_use]
    pub fn metadata(&self, id: impl Into<String>) -> Metadata {
        Metadata {
            id: id.into(),
            name: self.name.clone(),
            docs: self.docs.clone(),
            capabilities: self.capabilities.iter().map(Capability::info).collect(),
            senses: self.senses.clone(),
        }
    }
}

impl fmt::Debug for CapsuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsuleDefinition")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("senses", &self.senses)
            .field("middleware", &self.middleware.len())
            .field("on_boot", &self.on_boot.is_some())
            .field("on_shutdown", &self.on_shutdown.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`CapsuleDefinition`].
pub struct CapsuleDefinitionBuilder {
    name: String,
    docs: Option<String>,
    capabilities: Vec<Capability>,
    senses: Vec<SenseDescriptor>,
    middleware: Vec<SharedMiddleware>,
    on_boot: Option<LifecycleHook>,
    on_shutdown: Option<LifecycleHook>,
}

impl CapsuleDefinitionBuilder {
    /// Set the documentation string.
    #[must_use]
    pub fn docs(mut self, docs: impl Into<String>) -> Self {
        self.docs = Some(docs.into());
        self
    }

    /// Add a capability.
    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Declare a sense for introspection.
    #[must_use]
    pub fn sense(mut self, sense: SenseDescriptor) -> Self {
        self.senses.push(sense);
        self
    }

    /// Append capsule-level middleware. Runs before any operation-level
    /// middleware, in the order added.
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware<Value> + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Append an already-shared capsule-level middleware.
    #[must_use]
    pub fn shared_middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Set the boot hook.
    #[must_use]
    pub fn on_boot<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LifecycleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_boot = Some(box_hook(hook));
        self
    }

    /// Set the shutdown hook.
    #[must_use]
    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(LifecycleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_shutdown = Some(box_hook(hook));
        self
    }

    /// Validate and finish the definition.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidDefinition`] for an empty name, a
    /// duplicate capability name, or a duplicate operation name within a
    /// capability.
    pub fn build(self) -> CapsuleResult<CapsuleDefinition> {
        if self.name.trim().is_empty() {
            return Err(CapsuleError::InvalidDefinition(
                "capsule name must not be empty".into(),
            ));
        }
        for (i, capability) in self.capabilities.iter().enumerate() {
            if self
                .capabilities
                .iter()
                .take(i)
                .any(|earlier| earlier.name() == capability.name())
            {
                return Err(CapsuleError::InvalidDefinition(format!(
                    "duplicate capability '{}'",
                    capability.name()
                )));
            }
            if let Some(operation) = capability.duplicate_operation() {
                return Err(CapsuleError::InvalidDefinition(format!(
                    "duplicate operation '{operation}' in capability '{}'",
                    capability.name()
                )));
            }
        }

        Ok(CapsuleDefinition {
            name: self.name,
            docs: self.docs,
            capabilities: self.capabilities,
            senses: self.senses,
            middleware: self.middleware,
            on_boot: self.on_boot,
            on_shutdown: self.on_shutdown,
        })
    }
}

impl fmt::Debug for CapsuleDefinitionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsuleDefinitionBuilder")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities.len())
            .finish_non_exhaustive()
    }
}

fn box_hook<F, Fut>(hook: F) -> LifecycleHook
where
    F: Fn(LifecycleContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: LifecycleContext| hook(ctx).boxed())
}
