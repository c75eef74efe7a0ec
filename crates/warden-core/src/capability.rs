//! Capabilities: named groups of operations.

use crate::metadata::CapabilityInfo;
use crate::operation::Operation;

/// A namespace of related operations.
///
/// Operation names must be unique within a capability; duplicates are
/// rejected when the enclosing definition is built.
#[derive(Debug, Clone)]
pub struct Capability {
    name: String,
    docs: String,
    operations: Vec<Operation>,
}

impl Capability {
    /// Create an empty capability.
    pub fn new(name: impl Into<String>, docs: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: docs.into(),
            operations: Vec::new(),
        }
    }

    /// Add an operation.
    #[must_use]
    pub fn operation(mut self, operation: impl Into<Operation>) -> Self {
        self.operations.push(operation.into());
        self
    }

    /// Capability name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable documentation.
    #[must_use]
    pub fn docs(&self) -> &str {
        &self.docs
    }

    /// Operations in declaration order.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Look up an operation by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name() == name)
    }

    /// Introspection view of this capability.
    #[must_use]
    pub fn info(&self) -> CapabilityInfo {
        CapabilityInfo {
            name: self.name.clone(),
            docs: self.docs.clone(),
            operations: self.operations.iter().map(Operation::info).collect(),
        }
    }

    /// First operation name that appears more than once, if any.
    pub(crate) fn duplicate_operation(&self) -> Option<&str> {
        self.operations.iter().enumerate().find_map(|(i, op)| {
            self.operations
                .iter()
                .take(i)
                .any(|earlier| earlier.name() == op.name())
                .then(|| op.name())
        })
    }
}
