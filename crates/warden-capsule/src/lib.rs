//! Warden Capsule - the execution engine behind every capsule instance.
//!
//! This crate provides:
//! - [`CapsuleCore`]: the lifecycle state machine, invocation pipeline,
//!   in-flight cancellation tracking and stimulus fan-out
//! - [`CapsuleInstance`]: the contract shared by local and remote instances
//! - [`LocalInstance`]: the zero-overhead in-process implementation
//! - [`OperationRef`] and [`CapsuleInstanceExt`] for typed calls
//!
//! # Example
//!
//! ```rust
//! use serde::Deserialize;
//! use warden_capsule::{CapsuleInstance, LocalInstance};
//! use warden_core::{Capability, CapsuleDefinition, ExecutionContext, Operation};
//!
//! #[derive(Deserialize)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! # async fn example() -> warden_core::CapsuleResult<()> {
//! let definition = CapsuleDefinition::builder("calculator")
//!     .capability(Capability::new("math", "Arithmetic").operation(Operation::call(
//!         "add",
//!         |ctx: ExecutionContext<Add>| async move { Ok(ctx.params.a.wrapping_add(ctx.params.b)) },
//!     )))
//!     .build()?;
//!
//! let instance = LocalInstance::new(definition);
//! instance.boot().await?;
//! let sum = instance
//!     .trigger("math", "add", serde_json::json!({"a": 2, "b": 3}), None)
//!     .await?
//!     .into_value()?;
//! assert_eq!(sum, 5);
//! instance.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod engine;
mod instance;
mod invocation;
mod listeners;
mod local;

pub use engine::CapsuleCore;
pub use instance::{CapsuleInstance, CapsuleInstanceExt, OperationRef};
pub use listeners::{Listener, ListenerRegistry, Subscription};
pub use local::LocalInstance;
