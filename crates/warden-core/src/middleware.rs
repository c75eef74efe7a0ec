//! Middleware: policy hooks that run before an operation handler.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::context::InvocationContext;
use crate::error::{CapsuleError, CapsuleResult};

/// Outcome of a single middleware check.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Decision<P = Value> {
    /// Continue with the params unchanged.
    #[default]
    Accept,
    /// Abort the invocation. The handler never runs.
    Reject {
        /// Reason surfaced to the caller.
        reason: String,
    },
    /// Replace the params for every later middleware and the handler.
    Transform(P),
}

impl<P> Decision<P> {
    /// Create an accept decision.
    #[must_use]
    pub fn accept() -> Self {
        Self::Accept
    }

    /// Create a reject decision.
    #[must_use]
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    /// Create a transform decision.
    #[must_use]
    pub fn transform(params: P) -> Self {
        Self::Transform(params)
    }

    /// Check if this decision aborts the invocation.
    #[must_use]
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }
}

/// A policy hook run before an operation handler.
///
/// Capsule-level middleware is `Middleware<Value>` and sees every
/// invocation. Operation-level middleware is typed on the operation's
/// parameter type, so a [`Decision::Transform`] cannot change the shape.
///
/// Returning `Err` aborts the invocation and the error reaches the caller
/// unmodified.
#[async_trait]
pub trait Middleware<P = Value>: Send + Sync
where
    P: Send + Sync + 'static,
{
    /// Inspect an invocation.
    async fn check(&self, ctx: &InvocationContext<'_, P>) -> anyhow::Result<Decision<P>>;

    /// Optional name for debugging.
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// A shareable middleware trait object.
pub type SharedMiddleware<P = Value> = Arc<dyn Middleware<P>>;

/// Run `chain` in order against `params`, threading transforms through.
///
/// Stops at the first rejection or failure; later middleware never run.
///
/// # Errors
///
/// Returns [`CapsuleError::Rejected`] on the first rejection, or the
/// middleware's own error if one fails.
pub async fn run_chain<P>(
    chain: &[SharedMiddleware<P>],
    capability: &str,
    operation: &str,
    mut params: P,
    cancel: &CancellationToken,
) -> CapsuleResult<P>
where
    P: Send + Sync + 'static,
{
    for middleware in chain {
        let decision = {
            let ctx = InvocationContext {
                capability,
                operation,
                params: &params,
                cancel,
            };
            middleware
                .check(&ctx)
                .await
                .map_err(CapsuleError::from_middleware)?
        };
        match decision {
            Decision::Accept => {},
            Decision::Reject { reason } => return Err(CapsuleError::Rejected { reason }),
            Decision::Transform(next) => params = next,
        }
    }
    Ok(params)
}

/// Middleware backed by a synchronous closure.
pub struct FnMiddleware<P, F> {
    name: String,
    check: F,
    _params: PhantomData<fn() -> P>,
}

/// Wrap a synchronous closure as middleware.
///
/// ```rust
/// use warden_core::{Decision, middleware_fn};
///
/// let deny_all = middleware_fn("deny-all", |_ctx: &warden_core::InvocationContext<'_>| {
///     Ok(Decision::reject("policy"))
/// });
/// # let _ = deny_all;
/// ```
pub fn middleware_fn<P, F>(name: impl Into<String>, check: F) -> FnMiddleware<P, F>
where
    P: Send + Sync + 'static,
    F: Fn(&InvocationContext<'_, P>) -> anyhow::Result<Decision<P>> + Send + Sync,
{
    FnMiddleware {
        name: name.into(),
        check,
        _params: PhantomData,
    }
}

#[async_trait]
impl<P, F> Middleware<P> for FnMiddleware<P, F>
where
    P: Send + Sync + 'static,
    F: Fn(&InvocationContext<'_, P>) -> anyhow::Result<Decision<P>> + Send + Sync,
{
    async fn check(&self, ctx: &InvocationContext<'_, P>) -> anyhow::Result<Decision<P>> {
        (self.check)(ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<P, F> fmt::Debug for FnMiddleware<P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
