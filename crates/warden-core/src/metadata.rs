//! Introspection payload returned by `describe()`.

use serde::{Deserialize, Serialize};

use crate::definition::SenseDescriptor;
use crate::operation::ExecutionShape;

/// Description of a capsule instance, identical for local and remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Instance identifier.
    pub id: String,
    /// Capsule name.
    pub name: String,
    /// Capsule documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,
    /// Declared capabilities, in declaration order.
    pub capabilities: Vec<CapabilityInfo>,
    /// Declared senses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub senses: Vec<SenseDescriptor>,
}

impl Metadata {
    /// Look up the declared shape of `capability.operation`.
    #[must_use]
    pub fn operation_kind(&self, capability: &str, operation: &str) -> Option<ExecutionShape> {
        self.capabilities
            .iter()
            .find(|c| c.name == capability)?
            .operations
            .iter()
            .find(|o| o.name == operation)
            .map(|o| o.kind)
    }
}

/// Introspection view of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    /// Capability name.
    pub name: String,
    /// Capability documentation.
    pub docs: String,
    /// Operations in declaration order.
    pub operations: Vec<OperationInfo>,
}

/// Introspection view of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// Operation name.
    pub name: String,
    /// Operation documentation.
    pub docs: String,
    /// Human-readable signature.
    pub signature: String,
    /// Call or stream.
    pub kind: ExecutionShape,
}
