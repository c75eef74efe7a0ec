//! Prelude module - commonly used types for convenient import.
//!
//! Use `use warden_capsule::prelude::*;` to declare, run and call capsules
//! with one import.

pub use warden_core::prelude::*;

// Instances
pub use crate::{CapsuleCore, CapsuleInstance, CapsuleInstanceExt, LocalInstance};

// Stimulus listeners
pub use crate::{Listener, Subscription};

// Typed calls
pub use crate::OperationRef;
