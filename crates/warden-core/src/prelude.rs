//! Prelude module - commonly used types for convenient import.
//!
//! Use `use warden_core::prelude::*;` to import the types needed to declare
//! a capsule.

// Errors
pub use crate::{CapsuleError, CapsuleResult};

// Declaration
pub use crate::{Capability, CapsuleDefinition, Operation, SenseDescriptor};

// Middleware
pub use crate::{Decision, Middleware, middleware_fn};

// Contexts
pub use crate::{ExecutionContext, InvocationContext, LifecycleContext};

// Runtime values
pub use crate::{CancelReason, CancellationToken, Stimulus, TriggerOutput};
