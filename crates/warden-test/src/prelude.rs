//! Prelude module - commonly used test utilities.
//!
//! Use `use warden_test::prelude::*;` in test modules.

pub use crate::fixtures::{
    AddParams, CountParams, math_capability, math_capsule, math_capsule_builder, math_capsule_with,
    ordered_capsule, sensor_capsule,
};
pub use crate::harness::{
    RemotePair, both_placements, init_test_logging, remote_pair, remote_pair_with,
};
pub use crate::mocks::{OrderProbe, ProbeMiddleware, RecordingListener};
