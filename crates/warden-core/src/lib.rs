//! Warden Core - the static capability model for mediated capsules.
//!
//! This crate provides:
//! - The capability model: [`Operation`], [`Capability`], [`CapsuleDefinition`]
//! - The middleware contract ([`Middleware`], [`Decision`])
//! - The contexts handed to middleware, handlers and lifecycle hooks
//! - [`Stimulus`] and the [`Emitter`] that stamps provenance onto it
//! - A cooperative [`CancellationToken`] that carries a [`CancelReason`]
//! - The error taxonomy shared by local and remote instances
//!
//! Nothing in here executes anything on its own. The state machine that
//! drives a definition lives in `warden-capsule`.
//!
//! # Example
//!
//! ```rust
//! use serde::Deserialize;
//! use warden_core::{Capability, CapsuleDefinition, Operation};
//!
//! #[derive(Deserialize)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! let definition = CapsuleDefinition::builder("calculator")
//!     .capability(Capability::new("math", "Arithmetic").operation(
//!         Operation::call("add", |ctx: warden_core::ExecutionContext<Add>| async move {
//!             Ok(ctx.params.a.wrapping_add(ctx.params.b))
//!         }),
//!     ))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(definition.name(), "calculator");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod cancel;
mod capability;
mod context;
mod definition;
mod error;
mod lifecycle;
mod metadata;
mod middleware;
mod operation;
mod output;
mod stimulus;

pub use cancel::{CancelReason, CancellationToken, WaitForCancellation};
pub use capability::Capability;
pub use context::{ExecutionContext, InvocationContext, LifecycleContext};
pub use definition::{CapsuleDefinition, CapsuleDefinitionBuilder, LifecycleHook, SenseDescriptor};
pub use error::{CapsuleError, CapsuleResult, NotFoundKind};
pub use lifecycle::LifecycleState;
pub use metadata::{CapabilityInfo, Metadata, OperationInfo};
pub use middleware::{
    Decision, FnMiddleware, Middleware, SharedMiddleware, middleware_fn, run_chain,
};
pub use operation::{ExecutionShape, Operation, OperationBuilder, OperationCall};
pub use output::{TriggerOutput, ValueStream};
pub use stimulus::{EmitOrigin, Emitter, Stimulus, StimulusSink, StimulusSource};
