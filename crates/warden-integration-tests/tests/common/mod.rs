//! Shared helpers for integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use warden_capsule::{CapsuleInstance, LocalInstance};
use warden_core::{CapsuleDefinition, CapsuleError};

/// How long to wait for stimuli that cross the wire.
#[allow(dead_code)]
pub const DELIVERY: Duration = Duration::from_secs(5);

/// Placement labels, in the order [`open`] understands them.
#[allow(dead_code)]
pub const PLACEMENTS: [&str; 2] = ["local", "remote"];

/// A fresh instance of `definition` at `placement`.
#[allow(dead_code)]
pub async fn open(
    placement: &str,
    definition: impl Into<Arc<CapsuleDefinition>>,
) -> Arc<dyn CapsuleInstance> {
    match placement {
        "local" => Arc::new(LocalInstance::new(definition)),
        "remote" => {
            warden_test::remote_pair(definition)
                .await
                .expect("failed to connect remote pair")
                .instance
        },
        other => panic!("unknown placement {other}"),
    }
}

/// Local and remote instances of `definition`.
#[allow(dead_code)]
pub async fn placements(
    definition: CapsuleDefinition,
) -> Vec<(&'static str, Arc<dyn CapsuleInstance>)> {
    warden_test::both_placements(definition)
        .await
        .expect("failed to open placements")
}

/// Booted local and remote instances of `definition`.
#[allow(dead_code)]
pub async fn booted(
    definition: CapsuleDefinition,
) -> Vec<(&'static str, Arc<dyn CapsuleInstance>)> {
    let instances = placements(definition).await;
    for (placement, instance) in &instances {
        instance
            .boot()
            .await
            .unwrap_or_else(|e| panic!("{placement}: boot failed: {e}"));
    }
    instances
}

/// Params for `math.add`.
#[allow(dead_code)]
pub fn add(a: i64, b: i64) -> Value {
    json!({ "a": a, "b": b })
}

/// Trigger a call operation and return its value.
#[allow(dead_code)]
pub async fn call(
    instance: &dyn CapsuleInstance,
    capability: &str,
    operation: &str,
    params: Value,
) -> Result<Value, CapsuleError> {
    instance
        .trigger(capability, operation, params, None)
        .await?
        .into_value()
}

/// Trigger a stream operation and collect every item.
#[allow(dead_code)]
pub async fn collect(
    instance: &dyn CapsuleInstance,
    capability: &str,
    operation: &str,
    params: Value,
) -> Result<Vec<Value>, CapsuleError> {
    let mut stream = instance
        .trigger(capability, operation, params, None)
        .await?
        .into_stream()?;
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
    }
    Ok(items)
}
