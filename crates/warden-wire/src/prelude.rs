//! Prelude module - commonly used types for convenient import.
//!
//! Use `use warden_wire::prelude::*;` to open local or remote instances and
//! host capsules with one import.

pub use warden_capsule::prelude::*;

// Placement
pub use crate::{Placement, RemoteInstance, open_instance};

// Transports
pub use crate::{CommandTransport, StreamTransport, Transport};

// Hosting
pub use crate::CapsuleServer;
pub use crate::host::run_stdio_host;
