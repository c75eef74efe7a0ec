//! Fixture capsule definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use warden_core::{
    Capability, CapsuleDefinition, CapsuleDefinitionBuilder, ExecutionContext, LifecycleContext,
    Operation, SenseDescriptor, SharedMiddleware,
};

use crate::mocks::OrderProbe;

/// Params of `math.add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddParams {
    /// Left operand.
    pub a: i64,
    /// Right operand.
    pub b: i64,
}

/// Params of `math.count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountParams {
    /// Yield `0..to`.
    pub to: u32,
    /// Pause before each item after the first.
    #[serde(default)]
    pub delay_ms: u64,
}

/// The `math` capability.
///
/// - `add {a, b} -> a + b`, emitting `math.added {sum}`
/// - `count {to, delay_ms} -> stream 0..to`, stopping once cancelled
/// - `fail -> error "boom"`
/// - `wait -> reason`, resolving once the invocation is cancelled
#[must_use]
pub fn math_capability() -> Capability {
    Capability::new("math", "Integer arithmetic")
        .operation(
            Operation::call("add", |ctx: ExecutionContext<AddParams>| async move {
                let sum = ctx.params.a.wrapping_add(ctx.params.b);
                ctx.emit("math.added", json!({ "sum": sum }));
                Ok(sum)
            })
            .docs("Add two integers"),
        )
        .operation(
            Operation::stream("count", |ctx: ExecutionContext<CountParams>| {
                let CountParams { to, delay_ms } = ctx.params;
                futures::stream::unfold((0u32, ctx.cancel), move |(next, cancel)| async move {
                    if next >= to || cancel.is_cancelled() {
                        return None;
                    }
                    if next > 0 && delay_ms > 0 {
                        tokio::select! {
                            () = cancel.cancelled() => return None,
                            () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {},
                        }
                    }
                    Some((Ok::<_, anyhow::Error>(next), (next.saturating_add(1), cancel)))
                })
            })
            .docs("Count from zero"),
        )
        .operation(
            Operation::call("fail", |_ctx: ExecutionContext<Value>| async move {
                Err::<Value, _>(anyhow::anyhow!("boom"))
            })
            .docs("Always fails"),
        )
        .operation(
            Operation::call("wait", |ctx: ExecutionContext<Value>| async move {
                ctx.cancel.cancelled().await;
                Ok(ctx.cancel.reason().map(|r| r.as_str().to_owned()))
            })
            .docs("Resolve with the cancellation reason"),
        )
}

/// Builder for the `calculator` capsule, for adding middleware or hooks.
#[must_use]
pub fn math_capsule_builder() -> CapsuleDefinitionBuilder {
    CapsuleDefinition::builder("calculator")
        .docs("Arithmetic fixture")
        .sense(SenseDescriptor::new("math.added", "A sum was computed", "{sum: i64}"))
        .capability(math_capability())
}

/// The `calculator` capsule with only the [`math_capability`].
///
/// # Panics
///
/// Never; the definition is statically valid.
#[must_use]
pub fn math_capsule() -> CapsuleDefinition {
    math_capsule_builder()
        .build()
        .expect("calculator fixture is valid")
}

/// The `calculator` capsule behind the given capsule-level middleware.
///
/// # Panics
///
/// Never; the definition is statically valid.
#[must_use]
pub fn math_capsule_with(middleware: Vec<SharedMiddleware>) -> CapsuleDefinition {
    middleware
        .into_iter()
        .fold(math_capsule_builder(), CapsuleDefinitionBuilder::shared_middleware)
        .build()
        .expect("calculator fixture is valid")
}

/// A capsule whose lifecycle hooks emit.
///
/// Boot emits `sensor.online`, shutdown emits `sensor.offline`, and
/// `sensor.read` emits `sensor.reading {value}` and returns the value.
///
/// # Panics
///
/// Never; the definition is statically valid.
#[must_use]
pub fn sensor_capsule() -> CapsuleDefinition {
    CapsuleDefinition::builder("sensor")
        .sense(SenseDescriptor::new("sensor.online", "Sensor came up", "{}"))
        .sense(SenseDescriptor::new("sensor.reading", "A sample", "{value: i64}"))
        .sense(SenseDescriptor::new("sensor.offline", "Sensor went down", "{}"))
        .on_boot(|ctx: LifecycleContext| async move {
            ctx.emit("sensor.online", json!({}));
            Ok(())
        })
        .on_shutdown(|ctx: LifecycleContext| async move {
            ctx.emit("sensor.offline", json!({}));
            Ok(())
        })
        .capability(Capability::new("sensor", "Sampling").operation(Operation::call(
            "read",
            |ctx: ExecutionContext<Value>| async move {
                ctx.emit("sensor.reading", json!({ "value": 21 }));
                Ok(21)
            },
        )))
        .build()
        .expect("sensor fixture is valid")
}

/// A capsule whose middleware and handler record into `probe`.
///
/// Capsule-level middleware `A`, `B`; operation-level middleware `C` on
/// `math.op`; the handler records `handler`.
///
/// # Panics
///
/// Never; the definition is statically valid.
#[must_use]
pub fn ordered_capsule(probe: &OrderProbe) -> CapsuleDefinition {
    let handler_probe = probe.clone();
    CapsuleDefinition::builder("ordered")
        .middleware(probe.middleware("A"))
        .middleware(probe.middleware("B"))
        .capability(
            Capability::new("math", "Probed").operation(
                Operation::call("op", move |_ctx: ExecutionContext<Value>| {
                    let probe = handler_probe.clone();
                    async move {
                        probe.record("handler");
                        Ok(Value::Null)
                    }
                })
                .middleware(probe.middleware("C")),
            ),
        )
        .build()
        .expect("ordered fixture is valid")
}
