//! Name resolution, the middleware chain and error propagation, checked on
//! both placements.

mod common;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use warden_core::{
    Capability, CapsuleDefinition, CapsuleError, Decision, ExecutionContext, InvocationContext,
    NotFoundKind, Operation, SharedMiddleware, middleware_fn,
};
use warden_test::{
    OrderProbe, RecordingListener, math_capability, math_capsule, math_capsule_with,
    ordered_capsule,
};

use common::{DELIVERY, PLACEMENTS, add, booted, call, open};

#[tokio::test]
async fn test_add_returns_sum() {
    for (placement, instance) in booted(math_capsule()).await {
        let sum = call(&*instance, "math", "add", add(2, 3)).await.unwrap();
        assert_eq!(sum, json!(5), "{placement}");
    }
}

#[tokio::test]
async fn test_unknown_capability_names_it() {
    for (placement, instance) in booted(math_capsule()).await {
        let err = call(&*instance, "nope", "add", json!({})).await.unwrap_err();
        assert!(
            matches!(
                &err,
                CapsuleError::NotFound {
                    kind: NotFoundKind::Capability,
                    name,
                } if name == "nope"
            ),
            "{placement}: {err}"
        );
        assert!(err.to_string().contains("nope"), "{placement}");
    }
}

#[tokio::test]
async fn test_unknown_operation_names_it() {
    for (placement, instance) in booted(math_capsule()).await {
        let err = call(&*instance, "math", "sub", json!({})).await.unwrap_err();
        assert!(
            matches!(
                &err,
                CapsuleError::NotFound {
                    kind: NotFoundKind::Operation,
                    name,
                } if name == "sub"
            ),
            "{placement}: {err}"
        );
        assert!(err.to_string().contains("sub"), "{placement}");
    }
}

#[tokio::test]
async fn test_middleware_runs_capsule_then_operation_then_handler() {
    for placement in PLACEMENTS {
        let probe = OrderProbe::new();
        let instance = open(placement, ordered_capsule(&probe)).await;
        instance.boot().await.unwrap();

        call(&*instance, "math", "op", Value::Null).await.unwrap();

        assert_eq!(probe.calls(), vec!["A", "B", "C", "handler"], "{placement}");
    }
}

#[tokio::test]
async fn test_rejection_short_circuits_everything_after_it() {
    for placement in PLACEMENTS {
        let probe = OrderProbe::new();
        let reject: SharedMiddleware = Arc::new(probe.rejecting("deny", "policy"));
        let after: SharedMiddleware = Arc::new(probe.middleware("after"));
        let instance = open(placement, math_capsule_with(vec![reject, after])).await;
        instance.boot().await.unwrap();

        let recorder = RecordingListener::new();
        let _subscription = instance.on_stimulus(recorder.listener()).unwrap();

        let err = call(&*instance, "math", "add", add(1, 1)).await.unwrap_err();
        assert!(
            matches!(&err, CapsuleError::Rejected { reason } if reason == "policy"),
            "{placement}: {err}"
        );
        assert_eq!(probe.calls(), vec!["deny"], "{placement}");

        assert!(
            !recorder.wait_for(1, std::time::Duration::from_millis(50)).await,
            "{placement}: rejected invocation emitted {:?}",
            recorder.senses()
        );
    }
}

#[derive(Deserialize)]
struct Tagged {
    a: i64,
    b: i64,
    first: bool,
    second: bool,
}

fn tagging_capsule() -> CapsuleDefinition {
    let tag = |field: &'static str| {
        middleware_fn(field, move |ctx: &InvocationContext<'_>| {
            let mut params = ctx.params.clone();
            if let Value::Object(map) = &mut params {
                map.insert(field.to_owned(), Value::Bool(true));
            }
            Ok(Decision::transform(params))
        })
    };

    CapsuleDefinition::builder("tagging")
        .middleware(tag("first"))
        .middleware(tag("second"))
        .capability(Capability::new("math", "Tagged").operation(Operation::call(
            "echo",
            |ctx: ExecutionContext<Tagged>| async move {
                let p = ctx.params;
                Ok(json!({ "a": p.a, "b": p.b, "first": p.first, "second": p.second }))
            },
        )))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_transforms_compose() {
    for placement in PLACEMENTS {
        let instance = open(placement, tagging_capsule()).await;
        instance.boot().await.unwrap();

        let seen = call(&*instance, "math", "echo", add(4, 5)).await.unwrap();
        assert_eq!(
            seen,
            json!({ "a": 4, "b": 5, "first": true, "second": true }),
            "{placement}"
        );
    }
}

#[tokio::test]
async fn test_typed_operation_middleware_transforms_typed_params() {
    #[derive(serde::Serialize, Deserialize, Clone)]
    struct Amount {
        cents: u64,
    }

    let definition = CapsuleDefinition::builder("bank")
        .capability(
            Capability::new("ledger", "Money").operation(
                Operation::call("deposit", |ctx: ExecutionContext<Amount>| async move {
                    Ok(ctx.params.cents)
                })
                .middleware(middleware_fn(
                    "cap",
                    |ctx: &InvocationContext<'_, Amount>| {
                        Ok(Decision::transform(Amount {
                            cents: ctx.params.cents.min(100),
                        }))
                    },
                )),
            ),
        )
        .build()
        .unwrap();
    let definition = Arc::new(definition);

    for placement in PLACEMENTS {
        let instance = open(placement, Arc::clone(&definition)).await;
        instance.boot().await.unwrap();
        let value = call(&*instance, "ledger", "deposit", json!({ "cents": 250 }))
            .await
            .unwrap();
        assert_eq!(value, json!(100), "{placement}");
    }
}

#[tokio::test]
async fn test_params_of_the_wrong_shape_are_invalid_params() {
    for placement in PLACEMENTS {
        let instance = open(placement, math_capsule()).await;
        instance.boot().await.unwrap();

        let err = call(&*instance, "math", "add", json!({ "a": "two" }))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, CapsuleError::InvalidParams { operation, .. } if operation == "add"),
            "{placement}: {err}"
        );
    }
}

#[tokio::test]
async fn test_handler_error_propagates_unwrapped() {
    for placement in PLACEMENTS {
        let instance = open(placement, math_capsule()).await;
        instance.boot().await.unwrap();

        let err = call(&*instance, "math", "fail", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::Handler(_)), "{placement}: {err:?}");
        assert_eq!(err.to_string(), "boom", "{placement}");
    }
}

#[tokio::test]
async fn test_middleware_error_propagates_and_skips_handler() {
    for placement in PLACEMENTS {
        let probe = OrderProbe::new();
        let broken: SharedMiddleware = Arc::new(middleware_fn(
            "broken",
            |_ctx: &InvocationContext<'_>| -> anyhow::Result<Decision> {
                anyhow::bail!("policy store offline")
            },
        ));
        let after: SharedMiddleware = Arc::new(probe.middleware("after"));
        let instance = open(placement, math_capsule_with(vec![broken, after])).await;
        instance.boot().await.unwrap();

        let err = call(&*instance, "math", "add", add(1, 1)).await.unwrap_err();
        assert!(matches!(err, CapsuleError::Middleware(_)), "{placement}: {err:?}");
        assert!(err.to_string().contains("policy store offline"), "{placement}");
        assert!(probe.calls().is_empty(), "{placement}");
    }
}

#[tokio::test]
async fn test_concurrent_triggers_keep_their_own_provenance() {
    let definition = CapsuleDefinition::builder("twins")
        .capability(math_capability())
        .capability(Capability::new("echo", "Echo").operation(Operation::call(
            "say",
            |ctx: ExecutionContext<Value>| async move {
                tokio::task::yield_now().await;
                ctx.emit("said", ctx.params.clone());
                Ok(ctx.params)
            },
        )))
        .build()
        .unwrap();
    let definition = Arc::new(definition);

    for placement in PLACEMENTS {
        let instance = open(placement, Arc::clone(&definition)).await;
        instance.boot().await.unwrap();
        let recorder = RecordingListener::new();
        let _subscription = instance.on_stimulus(recorder.listener()).unwrap();

        let (sum, said) = tokio::join!(
            call(&*instance, "math", "add", add(1, 2)),
            call(&*instance, "echo", "say", json!("hi")),
        );
        assert_eq!(sum.unwrap(), json!(3), "{placement}");
        assert_eq!(said.unwrap(), json!("hi"), "{placement}");

        assert!(recorder.wait_for(2, DELIVERY).await, "{placement}");
        for stimulus in recorder.stimuli() {
            let source = stimulus.source.unwrap();
            match stimulus.sense.as_str() {
                "math.added" => assert_eq!(
                    (source.capability.as_str(), source.operation.as_str()),
                    ("math", "add")
                ),
                "said" => assert_eq!(
                    (source.capability.as_str(), source.operation.as_str()),
                    ("echo", "say")
                ),
                other => panic!("{placement}: unexpected sense {other}"),
            }
        }
    }
}
