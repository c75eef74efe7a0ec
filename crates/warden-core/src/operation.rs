//! Operations: the invocable units of a capability.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::context::ExecutionContext;
use crate::error::{CapsuleError, CapsuleResult};
use crate::metadata::OperationInfo;
use crate::middleware::{Middleware, SharedMiddleware, run_chain};
use crate::output::{TriggerOutput, ValueStream};
use crate::stimulus::Emitter;

/// Whether an operation returns one value or a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionShape {
    /// Single result.
    Call,
    /// Lazy, possibly unbounded, sequence of results.
    Stream,
}

impl fmt::Display for ExecutionShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => f.write_str("call"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

/// Everything the runtime hands an operation once capsule-level
/// middleware has accepted the invocation.
#[derive(Debug)]
pub struct OperationCall {
    /// Capability being invoked.
    pub capability: String,
    /// Operation being invoked.
    pub operation: String,
    /// Params after capsule-level middleware.
    pub params: Value,
    /// The invocation's internal cancellation token.
    pub cancel: CancellationToken,
    /// Emitter bound to this invocation's provenance.
    pub emitter: Emitter,
}

type CallFn<P> =
    Arc<dyn Fn(ExecutionContext<P>) -> BoxFuture<'static, CapsuleResult<Value>> + Send + Sync>;
type StreamFn<P> = Arc<dyn Fn(ExecutionContext<P>) -> ValueStream + Send + Sync>;

enum Handler<P> {
    Call(CallFn<P>),
    Stream(StreamFn<P>),
}

#[async_trait]
trait ErasedOperation: Send + Sync {
    async fn invoke(&self, call: OperationCall) -> CapsuleResult<TriggerOutput>;
}

struct TypedOperation<P> {
    middleware: Vec<SharedMiddleware<P>>,
    handler: Handler<P>,
}

#[async_trait]
impl<P> ErasedOperation for TypedOperation<P>
where
    P: DeserializeOwned + Send + Sync + 'static,
{
    async fn invoke(&self, call: OperationCall) -> CapsuleResult<TriggerOutput> {
        let OperationCall {
            capability,
            operation,
            params,
            cancel,
            emitter,
        } = call;

        // The one place a transformed or caller-supplied shape is checked.
        let params: P =
            serde_json::from_value(params).map_err(|e| CapsuleError::InvalidParams {
                operation: operation.clone(),
                message: e.to_string(),
            })?;

        let params =
            run_chain(&self.middleware, &capability, &operation, params, &cancel).await?;

        if let Some(reason) = cancel.reason() {
            return Err(CapsuleError::Cancelled { reason });
        }

        let ctx = ExecutionContext::new(params, cancel, emitter);
        match &self.handler {
            Handler::Call(handler) => handler(ctx).await.map(TriggerOutput::Value),
            Handler::Stream(handler) => Ok(TriggerOutput::Stream(handler(ctx))),
        }
    }
}

/// A declared operation. Immutable once built.
#[derive(Clone)]
pub struct Operation {
    name: String,
    docs: String,
    signature: String,
    shape: ExecutionShape,
    middleware_count: usize,
    inner: Arc<dyn ErasedOperation>,
}

impl Operation {
    /// Declare a call operation with a typed async handler.
    pub fn call<P, R, F, Fut>(name: impl Into<String>, handler: F) -> OperationBuilder<P>
    where
        P: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + Send + 'static,
        F: Fn(ExecutionContext<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler: CallFn<P> = Arc::new(
            move |ctx: ExecutionContext<P>| -> BoxFuture<'static, CapsuleResult<Value>> {
                let fut = handler(ctx);
                Box::pin(async move {
                    let value = fut.await.map_err(CapsuleError::from_handler)?;
                    Ok(serde_json::to_value(value)?)
                })
            },
        );
        OperationBuilder::new(
            name.into(),
            ExecutionShape::Call,
            format!("{} -> {}", short_type_name::<P>(), short_type_name::<R>()),
            Handler::Call(handler),
        )
    }

    /// Declare a stream operation with a typed handler producing a stream.
    ///
    /// The runtime stops polling the stream once the invocation is
    /// cancelled; producers that do their own waiting should also watch
    /// `ctx.cancel`.
    pub fn stream<P, R, F, S>(name: impl Into<String>, handler: F) -> OperationBuilder<P>
    where
        P: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + Send + 'static,
        F: Fn(ExecutionContext<P>) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<R>> + Send + 'static,
    {
        let handler: StreamFn<P> = Arc::new(move |ctx: ExecutionContext<P>| -> ValueStream {
            handler(ctx)
                .map(|item| {
                    let value = item.map_err(CapsuleError::from_handler)?;
                    Ok(serde_json::to_value(value)?)
                })
                .boxed()
        });
        OperationBuilder::new(
            name.into(),
            ExecutionShape::Stream,
            format!(
                "{} -> stream<{}>",
                short_type_name::<P>(),
                short_type_name::<R>()
            ),
            Handler::Stream(handler),
        )
    }

    /// Operation name (unique within its capability).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable documentation.
    #[must_use]
    pub fn docs(&self) -> &str {
        &self.docs
    }

    /// Human-readable signature.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Call or stream.
    #[must_use]
    pub fn shape(&self) -> ExecutionShape {
        self.shape
    }

    /// Number of operation-level middleware.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middleware_count
    }

    /// Run operation-level middleware and then the handler.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::InvalidParams`] if the params do not fit the
    /// declared type, [`CapsuleError::Rejected`] if a middleware rejects,
    /// [`CapsuleError::Cancelled`] if the token fired before the handler
    /// started, or whatever the middleware or handler failed with.
    pub async fn invoke(&self, call: OperationCall) -> CapsuleResult<TriggerOutput> {
        self.inner.invoke(call).await
    }

    /// Introspection view of this operation.
    #[must_use]
    pub fn info(&self) -> OperationInfo {
        OperationInfo {
            name: self.name.clone(),
            docs: self.docs.clone(),
            signature: self.signature.clone(),
            kind: self.shape,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("shape", &self.shape)
            .field("middleware_count", &self.middleware_count)
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`Operation::call`] and [`Operation::stream`].
pub struct OperationBuilder<P> {
    name: String,
    docs: String,
    signature: String,
    shape: ExecutionShape,
    middleware: Vec<SharedMiddleware<P>>,
    handler: Handler<P>,
}

impl<P> OperationBuilder<P>
where
    P: DeserializeOwned + Send + Sync + 'static,
{
    fn new(name: String, shape: ExecutionShape, signature: String, handler: Handler<P>) -> Self {
        Self {
            name,
            docs: String::new(),
            signature,
            shape,
            middleware: Vec::new(),
            handler,
        }
    }

    /// Set the documentation string.
    #[must_use]
    pub fn docs(mut self, docs: impl Into<String>) -> Self {
        self.docs = docs.into();
        self
    }

    /// Override the derived signature.
    #[must_use]
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Append operation-level middleware. Runs after capsule-level
    /// middleware, in the order added.
    #[must_use]
    pub fn middleware(mut self, middleware: impl Middleware<P> + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Append an already-shared operation-level middleware.
    #[must_use]
    pub fn shared_middleware(mut self, middleware: SharedMiddleware<P>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Finish the declaration.
    #[must_use]
    pub fn build(self) -> Operation {
        let middleware_count = self.middleware.len();
        Operation {
            name: self.name,
            docs: self.docs,
            signature: self.signature,
            shape: self.shape,
            middleware_count,
            inner: Arc::new(TypedOperation {
                middleware: self.middleware,
                handler: self.handler,
            }),
        }
    }
}

impl<P> From<OperationBuilder<P>> for Operation
where
    P: DeserializeOwned + Send + Sync + 'static,
{
    fn from(builder: OperationBuilder<P>) -> Self {
        builder.build()
    }
}

/// `std::any::type_name` with module paths stripped.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let mut out = String::with_capacity(full.len());
    let mut segment_start = 0;
    for ch in full.chars() {
        match ch {
            ':' => out.truncate(segment_start),
            '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&' => {
                out.push(ch);
                segment_start = out.len();
            },
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use crate::middleware::{Decision, middleware_fn};
    use crate::stimulus::{EmitOrigin, StimulusSink};
    use serde_json::json;

    struct NullSink;

    impl StimulusSink for NullSink {
        fn deliver(&self, _origin: &EmitOrigin, _sense: String, _data: Value) {}
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn call(params: Value) -> OperationCall {
        OperationCall {
            capability: "math".into(),
            operation: "add".into(),
            params,
            cancel: CancellationToken::new(),
            emitter: Emitter::new(Arc::new(NullSink), EmitOrigin::Instance),
        }
    }

    fn add() -> OperationBuilder<Add> {
        Operation::call("add", |ctx: ExecutionContext<Add>| async move {
            Ok(ctx.params.a.wrapping_add(ctx.params.b))
        })
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Vec<i64>>(), "Vec<i64>");
        assert_eq!(short_type_name::<Value>(), "Value");
        assert_eq!(short_type_name::<(i64, String)>(), "(i64, String)");
    }

    #[test]
    fn test_derived_signature() {
        let op = add().build();
        assert_eq!(op.signature(), "Add -> i64");
        assert_eq!(op.shape(), ExecutionShape::Call);
        assert_eq!(op.info().kind, ExecutionShape::Call);
    }

    #[tokio::test]
    async fn test_invoke_call() {
        let op = add().build();
        let out = op.invoke(call(json!({"a": 2, "b": 3}))).await.unwrap();
        assert_eq!(out.into_value().unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let op = add().build();
        let err = op.invoke(call(json!({"a": "two"}))).await.unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_typed_transform_reaches_handler() {
        let op = add()
            .middleware(middleware_fn("double-a", |ctx: &InvocationContext<'_, Add>| {
                Ok(Decision::transform(Add {
                    a: ctx.params.a.wrapping_mul(2),
                    b: ctx.params.b,
                }))
            }))
            .build();
        assert_eq!(op.middleware_count(), 1);

        let out = op.invoke(call(json!({"a": 2, "b": 3}))).await.unwrap();
        assert_eq!(out.into_value().unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_cancelled_before_handler() {
        let op = add().build();
        let request = call(json!({"a": 1, "b": 1}));
        request.cancel.cancel(crate::CancelReason::User);

        let err = op.invoke(request).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_stream_items_are_serialized() {
        let op = Operation::stream("count", |_ctx: ExecutionContext<Value>| {
            futures::stream::iter(vec![Ok(1_u32), Ok(2), Err(anyhow::anyhow!("sensor unplugged"))])
        })
        .build();
        assert_eq!(op.signature(), "Value -> stream<u32>");

        let stream = op.invoke(call(Value::Null)).await.unwrap().into_stream().unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert_eq!(
            items[2].as_ref().unwrap_err().to_string(),
            "sensor unplugged"
        );
    }
}
