//! The public instance contract shared by local and remote capsules.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use warden_core::{CancellationToken, CapsuleResult, Metadata, TriggerOutput};

use crate::listeners::{Listener, Subscription};

/// A running capsule, wherever it runs.
///
/// Local and remote implementations are observably identical: the same
/// lifecycle guards, the same error kinds, the same stimulus shape.
#[async_trait]
pub trait CapsuleInstance: Send + Sync {
    /// Introspection payload. Never a round trip.
    ///
    /// # Errors
    ///
    /// Remote instances return [`warden_core::CapsuleError::MetadataNotLoaded`]
    /// until connected.
    fn describe(&self) -> CapsuleResult<Metadata>;

    /// Run the boot hook and start accepting triggers.
    async fn boot(&self) -> CapsuleResult<()>;

    /// Cancel in-flight work, run the shutdown hook and stop for good.
    async fn shutdown(&self) -> CapsuleResult<()>;

    /// Invoke `capability.operation` with JSON params.
    async fn trigger(
        &self,
        capability: &str,
        operation: &str,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> CapsuleResult<TriggerOutput>;

    /// Emit a stimulus on the instance itself.
    ///
    /// # Errors
    ///
    /// Remote instances always return
    /// [`warden_core::CapsuleError::CannotEmit`].
    fn emit(&self, sense: &str, data: Value) -> CapsuleResult<()>;

    /// Register a stimulus listener.
    ///
    /// # Errors
    ///
    /// Remote instances return
    /// [`warden_core::CapsuleError::ConnectionNotEstablished`] until
    /// connected.
    fn on_stimulus(&self, listener: Listener) -> CapsuleResult<Subscription>;
}

/// A typed handle on one operation.
///
/// Names are still checked at runtime by the instance; the handle fixes the
/// parameter and result types at compile time.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use warden_capsule::OperationRef;
///
/// #[derive(Serialize, Deserialize)]
/// struct Add {
///     a: i64,
///     b: i64,
/// }
///
/// const ADD: OperationRef<Add, i64> = OperationRef::new("math", "add");
/// assert_eq!(ADD.capability(), "math");
/// ```
pub struct OperationRef<P, R> {
    capability: &'static str,
    operation: &'static str,
    _types: PhantomData<fn(P) -> R>,
}

impl<P, R> OperationRef<P, R> {
    /// Name an operation.
    #[must_use]
    pub const fn new(capability: &'static str, operation: &'static str) -> Self {
        Self {
            capability,
            operation,
            _types: PhantomData,
        }
    }

    /// Capability name.
    #[must_use]
    pub const fn capability(&self) -> &'static str {
        self.capability
    }

    /// Operation name.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }
}

impl<P, R> Clone for OperationRef<P, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, R> Copy for OperationRef<P, R> {}

impl<P, R> fmt::Debug for OperationRef<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationRef({}.{})", self.capability, self.operation)
    }
}

/// Typed convenience calls on any [`CapsuleInstance`].
#[async_trait]
pub trait CapsuleInstanceExt: CapsuleInstance {
    /// Trigger a call operation and deserialize its result.
    async fn call<P, R>(
        &self,
        op: OperationRef<P, R>,
        params: &P,
        cancel: Option<CancellationToken>,
    ) -> CapsuleResult<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        self.trigger(op.capability(), op.operation(), params, cancel)
            .await?
            .into_typed()
    }

    /// Trigger a stream operation and deserialize each item.
    async fn stream<P, R>(
        &self,
        op: OperationRef<P, R>,
        params: &P,
        cancel: Option<CancellationToken>,
    ) -> CapsuleResult<BoxStream<'static, CapsuleResult<R>>>
    where
        P: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        let params = serde_json::to_value(params)?;
        let stream = self
            .trigger(op.capability(), op.operation(), params, cancel)
            .await?
            .into_stream()?;
        Ok(stream
            .map(|item| Ok(serde_json::from_value(item?)?))
            .boxed())
    }
}

impl<T: CapsuleInstance + ?Sized> CapsuleInstanceExt for T {}
