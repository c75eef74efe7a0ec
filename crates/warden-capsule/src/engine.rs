//! The capsule state machine and invocation pipeline.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{StreamExt, future};
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use warden_core::{
    CancelReason, CancellationToken, CapsuleDefinition, CapsuleError, CapsuleResult, EmitOrigin,
    Emitter, LifecycleContext, LifecycleHook, LifecycleState, Metadata, OperationCall, Stimulus,
    StimulusSink, StimulusSource, TriggerOutput, run_chain,
};

use crate::invocation::InFlightGuard;
use crate::listeners::{Listener, ListenerRegistry, Subscription};

/// Runs one [`CapsuleDefinition`]: owns the lifecycle state, the in-flight
/// cancellation tokens and the stimulus listeners.
///
/// Boot and shutdown are serialized against each other. Triggers run
/// concurrently with each other and with lifecycle calls; the in-flight set
/// and the state flag share one lock, so shutdown cannot miss a trigger
/// that registered before it started draining.
pub struct CapsuleCore {
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

pub(crate) struct Shared {
    id: String,
    definition: Arc<CapsuleDefinition>,
    state: Mutex<CoreState>,
    hook_active: AtomicBool,
    listeners: ListenerRegistry,
}

struct CoreState {
    lifecycle: LifecycleState,
    draining: bool,
    in_flight: HashMap<u64, CancellationToken>,
    next_invocation: u64,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release(&self, invocation: u64) {
        if self.lock_state().in_flight.remove(&invocation).is_some() {
            trace!(capsule = %self.definition.name(), invocation, "Invocation finished");
        }
    }

    fn accepts(&self, origin: &EmitOrigin) -> bool {
        let booted = self.lock_state().lifecycle == LifecycleState::Booted;
        match origin {
            EmitOrigin::Lifecycle => booted || self.hook_active.load(Ordering::SeqCst),
            EmitOrigin::Operation(_) | EmitOrigin::Instance => booted,
        }
    }
}

impl StimulusSink for Shared {
    /// The state is checked again before each listener, so a stimulus that
    /// races shutdown is not handed to anyone once the state has flipped.
    /// A listener already running when the flip happens finishes its call.
    fn deliver(&self, origin: &EmitOrigin, sense: String, data: Value) {
        if !self.accepts(origin) {
            trace!(
                capsule = %self.definition.name(),
                %sense,
                "Dropping stimulus emitted outside booted state"
            );
            return;
        }

        let stimulus = Stimulus::now(sense, data, origin.source().cloned());
        self.listeners.notify_while(&stimulus, || self.accepts(origin));
    }
}

/// Clears the hook flag when a lifecycle hook finishes, fails, or is dropped.
struct HookWindow<'a>(&'a AtomicBool);

impl<'a> HookWindow<'a> {
    fn open(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for HookWindow<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Completes the move to `shutdown` once draining has begun, even if the
/// shutdown future is dropped while the hook is still running.
struct Teardown<'a>(&'a Shared);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.0.lock_state();
            state.lifecycle = LifecycleState::Shutdown;
            state.draining = false;
        }
        self.0.listeners.clear();
    }
}

impl CapsuleCore {
    /// Create an instance in the `created` state with a fresh id.
    pub fn new(definition: impl Into<Arc<CapsuleDefinition>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4().to_string(),
                definition: definition.into(),
                state: Mutex::new(CoreState {
                    lifecycle: LifecycleState::Created,
                    draining: false,
                    in_flight: HashMap::new(),
                    next_invocation: 0,
                }),
                hook_active: AtomicBool::new(false),
                listeners: ListenerRegistry::new(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Instance id, as reported by [`describe`](Self::describe).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The definition this instance runs.
    #[must_use]
    pub fn definition(&self) -> &Arc<CapsuleDefinition> {
        &self.shared.definition
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.lock_state().lifecycle
    }

    /// Number of invocations currently registered as in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.lock_state().in_flight.len()
    }

    /// Introspection payload.
    #[must_use]
    pub fn describe(&self) -> Metadata {
        self.shared.definition.metadata(self.shared.id.clone())
    }

    /// Move from `created` to `booted`, running the boot hook.
    ///
    /// Idempotent once booted. A failing hook leaves the instance in
    /// `created`, so boot may be retried.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::IllegalState`] after shutdown, or the boot
    /// hook's error.
    pub async fn boot(&self) -> CapsuleResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let name = self.shared.definition.name();

        match self.state() {
            LifecycleState::Booted => {
                debug!(capsule = %name, "Boot requested on a booted capsule");
                return Ok(());
            },
            LifecycleState::Shutdown => {
                return Err(CapsuleError::boot_after_shutdown());
            },
            LifecycleState::Created => {},
        }

        if let Some(hook) = self.shared.definition.boot_hook() {
            if let Err(e) = self.run_hook(hook).await {
                warn!(capsule = %name, error = %e, "Boot hook failed");
                return Err(CapsuleError::from_hook(e));
            }
        }

        self.shared.lock_state().lifecycle = LifecycleState::Booted;
        info!(capsule = %name, id = %self.shared.id, "Capsule booted");
        Ok(())
    }

    /// Move from `booted` to `shutdown`.
    ///
    /// Cancels every in-flight invocation with [`CancelReason::System`],
    /// runs the shutdown hook, then always completes the transition and
    /// drops every listener. Idempotent once shut down.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::IllegalState`] if the capsule was never
    /// booted, or the shutdown hook's error after teardown has completed.
    pub async fn shutdown(&self) -> CapsuleResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let name = self.shared.definition.name();

        let cancelled: Vec<CancellationToken> = {
            let mut state = self.shared.lock_state();
            match state.lifecycle {
                LifecycleState::Shutdown => {
                    debug!(capsule = %name, "Shutdown requested on a stopped capsule");
                    return Ok(());
                },
                LifecycleState::Created => {
                    return Err(CapsuleError::shutdown_before_boot());
                },
                LifecycleState::Booted => {},
            }
            state.draining = true;
            state.in_flight.drain().map(|(_, token)| token).collect()
        };
        let teardown = Teardown(self.shared.as_ref());

        debug!(capsule = %name, in_flight = cancelled.len(), "Cancelling in-flight invocations");
        for token in &cancelled {
            token.cancel(CancelReason::System);
        }

        let hook_result = match self.shared.definition.shutdown_hook() {
            Some(hook) => self.run_hook(hook).await.map_err(CapsuleError::from_hook),
            None => Ok(()),
        };

        drop(teardown);

        match &hook_result {
            Ok(()) => info!(capsule = %name, "Capsule shut down"),
            Err(e) => warn!(capsule = %name, error = %e, "Capsule shut down; shutdown hook failed"),
        }
        hook_result
    }

    /// Invoke `capability.operation`.
    ///
    /// The external token, if given, is linked to the invocation's own
    /// token; cancelling it cancels the invocation with the same reason.
    /// Stream results stop yielding once the invocation is cancelled, and
    /// end after their first error.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::IllegalState`] unless booted,
    /// [`CapsuleError::Cancelled`] if `cancel` already fired,
    /// [`CapsuleError::NotFound`] for unknown names,
    /// [`CapsuleError::Rejected`] if a middleware rejects, or the
    /// middleware's or handler's own error.
    pub async fn trigger(
        &self,
        capability: &str,
        operation: &str,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> CapsuleResult<TriggerOutput> {
        let (invocation, token) = self.register(capability, operation, cancel.as_ref())?;
        let guard = InFlightGuard::new(Arc::clone(&self.shared), invocation);

        debug!(
            capsule = %self.shared.definition.name(),
            capability,
            operation,
            invocation,
            "Trigger"
        );

        let definition = &self.shared.definition;
        let op = definition
            .capability(capability)
            .ok_or_else(|| CapsuleError::capability_not_found(capability))?
            .get(operation)
            .ok_or_else(|| CapsuleError::operation_not_found(operation))?;

        let params = run_chain(definition.middleware(), capability, operation, params, &token)
            .await
            .inspect_err(|e| {
                debug!(capability, operation, error = %e, "Capsule middleware stopped trigger");
            })?;

        let sink: Arc<dyn StimulusSink> = Arc::clone(&self.shared) as Arc<dyn StimulusSink>;
        let output = op
            .invoke(OperationCall {
                capability: capability.to_string(),
                operation: operation.to_string(),
                params,
                cancel: token.clone(),
                emitter: Emitter::new(
                    sink,
                    EmitOrigin::Operation(StimulusSource::new(capability, operation)),
                ),
            })
            .await?;

        match output {
            TriggerOutput::Value(value) => Ok(TriggerOutput::Value(value)),
            TriggerOutput::Stream(stream) => {
                // The registration lives as long as the stream does. The
                // first error is the last item.
                let stream = stream
                    .take_until(token.cancelled())
                    .scan(false, |failed, item| {
                        if *failed {
                            return future::ready(None);
                        }
                        *failed = item.is_err();
                        future::ready(Some(item))
                    })
                    .map(move |item| {
                        let _registered = &guard;
                        item
                    })
                    .fuse()
                    .boxed();
                Ok(TriggerOutput::Stream(stream))
            },
        }
    }

    /// Emit a stimulus from outside any operation. Accepted only while
    /// booted; otherwise a no-op.
    pub fn emit(&self, sense: impl Into<String>, data: Value) {
        self.shared.deliver(&EmitOrigin::Instance, sense.into(), data);
    }

    /// Register a stimulus listener.
    pub fn on_stimulus(&self, listener: Listener) -> Subscription {
        self.shared.listeners.subscribe(listener)
    }

    /// Check state and register a new in-flight token, atomically with
    /// respect to shutdown.
    fn register(
        &self,
        capability: &str,
        operation: &str,
        external: Option<&CancellationToken>,
    ) -> CapsuleResult<(u64, CancellationToken)> {
        let mut state = self.shared.lock_state();
        if state.lifecycle != LifecycleState::Booted {
            return Err(CapsuleError::trigger_not_booted(
                state.lifecycle,
                capability,
                operation,
            ));
        }
        if state.draining {
            return Err(CapsuleError::illegal_state(
                LifecycleState::Booted,
                "capsule is shutting down",
            ));
        }

        let token = match external {
            Some(external) if external.is_cancelled() => {
                return Err(CapsuleError::Cancelled {
                    reason: external.reason().unwrap_or(CancelReason::User),
                });
            },
            Some(external) => external.child(),
            None => CancellationToken::new(),
        };

        let invocation = state.next_invocation;
        state.next_invocation = invocation.wrapping_add(1);
        state.in_flight.insert(invocation, token.clone());
        Ok((invocation, token))
    }

    async fn run_hook(&self, hook: &LifecycleHook) -> anyhow::Result<()> {
        let sink: Arc<dyn StimulusSink> = Arc::clone(&self.shared) as Arc<dyn StimulusSink>;
        let ctx = LifecycleContext::new(Emitter::new(sink, EmitOrigin::Lifecycle));
        let _window = HookWindow::open(&self.shared.hook_active);
        hook(ctx).await
    }
}

impl fmt::Debug for CapsuleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsuleCore")
            .field("id", &self.shared.id)
            .field("name", &self.shared.definition.name())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::Notify;
    use warden_core::{
        Capability, Decision, ExecutionContext, InvocationContext, Operation, middleware_fn,
    };

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn math() -> Capability {
        Capability::new("math", "Arithmetic").operation(Operation::call(
            "add",
            |ctx: ExecutionContext<Add>| async move {
                ctx.emit("added", json!({"a": ctx.params.a}));
                Ok(ctx.params.a.wrapping_add(ctx.params.b))
            },
        ))
    }

    fn calc() -> CapsuleCore {
        CapsuleCore::new(
            CapsuleDefinition::builder("calc")
                .capability(math())
                .build()
                .unwrap(),
        )
    }

    /// A capsule whose shutdown hook signals `started` and then waits for
    /// `release`.
    fn slow_shutdown(started: &Arc<Notify>, release: &Arc<Notify>) -> CapsuleCore {
        let started = Arc::clone(started);
        let release = Arc::clone(release);
        let definition = CapsuleDefinition::builder("slow")
            .capability(math())
            .on_shutdown(move |_ctx| {
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                }
            })
            .build()
            .unwrap();
        CapsuleCore::new(definition)
    }

    fn collect(core: &CapsuleCore) -> Arc<StdMutex<Vec<Stimulus>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = core.on_stimulus(Arc::new(move |s: &Stimulus| {
            sink.lock().unwrap().push(s.clone());
        }));
        seen
    }

    #[tokio::test]
    async fn test_trigger_requires_booted() {
        let core = calc();

        let err = core
            .trigger("math", "add", json!({"a": 1, "b": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapsuleError::IllegalState {
                state: LifecycleState::Created,
                ..
            }
        ));

        core.boot().await.unwrap();
        let out = core
            .trigger("math", "add", json!({"a": 2, "b": 3}), None)
            .await
            .unwrap();
        assert_eq!(out.into_value().unwrap(), json!(5));
        assert_eq!(core.in_flight(), 0);

        core.shutdown().await.unwrap();
        let err = core
            .trigger("math", "add", json!({"a": 1, "b": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapsuleError::IllegalState {
                state: LifecycleState::Shutdown,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_boot_failure_leaves_created_and_allows_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let definition = CapsuleDefinition::builder("flaky")
            .on_boot(move |_ctx| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        anyhow::bail!("warming up");
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap();
        let core = CapsuleCore::new(definition);

        let err = core.boot().await.unwrap_err();
        assert_eq!(err.to_string(), "warming up");
        assert_eq!(core.state(), LifecycleState::Created);

        core.boot().await.unwrap();
        core.boot().await.unwrap();
        assert_eq!(core.state(), LifecycleState::Booted);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_before_boot_fails() {
        let core = CapsuleCore::new(CapsuleDefinition::builder("idle").build().unwrap());
        let err = core.shutdown().await.unwrap_err();
        assert!(matches!(
            err,
            CapsuleError::IllegalState {
                state: LifecycleState::Created,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_boot_after_shutdown_fails() {
        let core = CapsuleCore::new(CapsuleDefinition::builder("idle").build().unwrap());
        core.boot().await.unwrap();
        core.shutdown().await.unwrap();
        core.shutdown().await.unwrap();
        assert!(core.boot().await.is_err());
    }

    #[tokio::test]
    async fn test_failing_shutdown_hook_still_tears_down() {
        let definition = CapsuleDefinition::builder("leaky")
            .on_shutdown(|ctx| async move {
                ctx.emit("closing", Value::Null);
                anyhow::bail!("flush failed")
            })
            .build()
            .unwrap();
        let core = CapsuleCore::new(definition);
        core.boot().await.unwrap();
        let seen = collect(&core);

        let err = core.shutdown().await.unwrap_err();
        assert_eq!(err.to_string(), "flush failed");
        assert_eq!(core.state(), LifecycleState::Shutdown);

        // The hook's own emission reached listeners registered before shutdown.
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(core.shared.listeners.len(), 0);
    }

    #[tokio::test]
    async fn test_boot_hook_emits_without_source() {
        let definition = CapsuleDefinition::builder("chatty")
            .on_boot(|ctx| async move {
                ctx.emit("ready", json!(true));
                Ok(())
            })
            .build()
            .unwrap();
        let core = CapsuleCore::new(definition);
        let seen = collect(&core);

        core.boot().await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sense, "ready");
        assert!(seen[0].source.is_none());
    }

    #[tokio::test]
    async fn test_emit_outside_booted_is_dropped() {
        let core = CapsuleCore::new(CapsuleDefinition::builder("quiet").build().unwrap());
        let seen = collect(&core);

        core.emit("early", Value::Null);
        core.boot().await.unwrap();
        core.emit("live", Value::Null);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sense, "live");
    }

    #[tokio::test]
    async fn test_handler_stimulus_carries_provenance() {
        let core = calc();
        core.boot().await.unwrap();
        let seen = collect(&core);

        core.trigger("math", "add", json!({"a": 1, "b": 2}), None)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].source, Some(StimulusSource::new("math", "add")));
    }

    #[tokio::test]
    async fn test_not_found_names_the_missing_part() {
        let core = calc();
        core.boot().await.unwrap();

        let err = core.trigger("nope", "add", json!({}), None).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
        let err = core.trigger("math", "sub", json!({}), None).await.unwrap_err();
        assert!(err.to_string().contains("sub"));
        assert_eq!(core.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_capsule_middleware_rejects_before_handler() {
        let definition = CapsuleDefinition::builder("locked")
            .capability(math())
            .middleware(middleware_fn("deny", |_ctx: &InvocationContext<'_>| {
                Ok(Decision::reject("policy"))
            }))
            .build()
            .unwrap();
        let core = CapsuleCore::new(definition);
        core.boot().await.unwrap();
        let seen = collect(&core);

        let err = core
            .trigger("math", "add", json!({"a": 1, "b": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::Rejected { ref reason } if reason == "policy"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_token_fails_fast() {
        let core = calc();
        core.boot().await.unwrap();

        let token = CancellationToken::new();
        token.cancel(CancelReason::Timeout);
        let err = core
            .trigger("math", "add", json!({"a": 1, "b": 1}), Some(token))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapsuleError::Cancelled {
                reason: CancelReason::Timeout
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_with_system_reason() {
        let observed = Arc::new(StdMutex::new(None));
        let slot = Arc::clone(&observed);
        let definition = CapsuleDefinition::builder("slow")
            .capability(Capability::new("work", "").operation(Operation::call(
                "wait",
                move |ctx: ExecutionContext<Value>| {
                    let slot = Arc::clone(&slot);
                    async move {
                        ctx.cancel.cancelled().await;
                        *slot.lock().unwrap() = ctx.cancel.reason();
                        Ok(Value::Null)
                    }
                },
            )))
            .build()
            .unwrap();
        let core = Arc::new(CapsuleCore::new(definition));
        core.boot().await.unwrap();

        let runner = Arc::clone(&core);
        let task =
            tokio::spawn(async move { runner.trigger("work", "wait", Value::Null, None).await });
        while core.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        core.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(CancelReason::System));
    }

    #[tokio::test]
    async fn test_stream_stops_after_cancel() {
        let definition = CapsuleDefinition::builder("ticker")
            .capability(Capability::new("clock", "").operation(Operation::stream(
                "ticks",
                |_ctx: ExecutionContext<Value>| {
                    futures::stream::iter((0_u64..).map(Ok::<_, anyhow::Error>))
                },
            )))
            .build()
            .unwrap();
        let core = CapsuleCore::new(definition);
        core.boot().await.unwrap();

        let token = CancellationToken::new();
        let mut stream = core
            .trigger("clock", "ticks", Value::Null, Some(token.clone()))
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        assert_eq!(core.in_flight(), 1);

        assert_eq!(stream.next().await.unwrap().unwrap(), json!(0));
        token.cancel(CancelReason::User);
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());

        drop(stream);
        assert_eq!(core.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_after_first_error() {
        let definition = CapsuleDefinition::builder("faulty")
            .capability(Capability::new("sensor", "").operation(Operation::stream(
                "samples",
                |_ctx: ExecutionContext<Value>| {
                    futures::stream::iter(vec![
                        Ok(json!(1)),
                        Err(anyhow::anyhow!("sensor fault")),
                        Ok(json!(2)),
                    ])
                },
            )))
            .build()
            .unwrap();
        let core = CapsuleCore::new(definition);
        core.boot().await.unwrap();

        let mut stream = core
            .trigger("sensor", "samples", Value::Null, None)
            .await
            .unwrap()
            .into_stream()
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));
        assert_eq!(
            stream.next().await.unwrap().unwrap_err().to_string(),
            "sensor fault"
        );
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());

        drop(stream);
        assert_eq!(core.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_trigger_during_shutdown_hook_is_refused() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let core = Arc::new(slow_shutdown(&started, &release));
        core.boot().await.unwrap();

        let stopper = Arc::clone(&core);
        let shutdown = tokio::spawn(async move { stopper.shutdown().await });
        started.notified().await;

        let err = core
            .trigger("math", "add", json!({"a": 1, "b": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapsuleError::IllegalState {
                state: LifecycleState::Booted,
                ..
            }
        ));
        assert!(err.to_string().contains("shutting down"), "{err}");
        assert_eq!(core.in_flight(), 0);

        release.notify_one();
        shutdown.await.unwrap().unwrap();
        assert_eq!(core.state(), LifecycleState::Shutdown);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_still_completes_teardown() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let core = slow_shutdown(&started, &release);
        core.boot().await.unwrap();
        let seen = collect(&core);

        let dropped = tokio::time::timeout(Duration::from_millis(20), core.shutdown()).await;
        assert!(dropped.is_err());

        assert_eq!(core.state(), LifecycleState::Shutdown);
        assert!(core.shared.listeners.is_empty());
        assert!(core.boot().await.is_err());
        let err = core
            .trigger("math", "add", json!({"a": 1, "b": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapsuleError::IllegalState {
                state: LifecycleState::Shutdown,
                ..
            }
        ));
        core.shutdown().await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }
}
