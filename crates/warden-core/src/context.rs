//! Contexts handed to middleware, handlers and lifecycle hooks.
//!
//! Middleware gets a read-only view. Handlers and hooks get an emitter
//! whose provenance was fixed by the runtime.

use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::stimulus::Emitter;

/// Read-only view of an invocation, handed to middleware.
#[derive(Debug)]
pub struct InvocationContext<'a, P = Value> {
    /// Capability being invoked.
    pub capability: &'a str,
    /// Operation being invoked.
    pub operation: &'a str,
    /// Params as they stand after earlier middleware.
    pub params: &'a P,
    /// The invocation's cancellation token.
    pub cancel: &'a CancellationToken,
}

/// Context handed to an operation handler.
#[derive(Debug)]
pub struct ExecutionContext<P> {
    /// Final params, after every middleware transform.
    pub params: P,
    /// Poll this between units of work and stop once it fires.
    pub cancel: CancellationToken,
    emitter: Emitter,
}

impl<P> ExecutionContext<P> {
    /// Assemble a context. Called by the runtime.
    #[must_use]
    pub fn new(params: P, cancel: CancellationToken, emitter: Emitter) -> Self {
        Self {
            params,
            cancel,
            emitter,
        }
    }

    /// Emit a stimulus attributed to this invocation's operation.
    pub fn emit(&self, sense: impl Into<String>, data: Value) {
        self.emitter.emit(sense, data);
    }

    /// A clone of the emitter, for handing to spawned work.
    #[must_use]
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    /// Whether the invocation has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Context handed to boot and shutdown hooks. Exposes only `emit`.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    emitter: Emitter,
}

impl LifecycleContext {
    /// Assemble a context. Called by the runtime.
    #[must_use]
    pub fn new(emitter: Emitter) -> Self {
        Self { emitter }
    }

    /// Emit a stimulus with no operation provenance.
    pub fn emit(&self, sense: impl Into<String>, data: Value) {
        self.emitter.emit(sense, data);
    }

    /// A clone of the emitter, for wiring up background emission.
    #[must_use]
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }
}
