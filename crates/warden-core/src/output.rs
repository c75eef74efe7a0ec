//! What a trigger hands back to its caller.

use std::fmt;

use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CapsuleError, CapsuleResult};

/// A lazy, cancellable sequence of stream items.
pub type ValueStream = BoxStream<'static, CapsuleResult<Value>>;

/// Result of a trigger: a single value for call operations, or a lazy
/// sequence for stream operations.
pub enum TriggerOutput {
    /// The return value of a call operation.
    Value(Value),
    /// The item sequence of a stream operation.
    Stream(ValueStream),
}

impl TriggerOutput {
    /// Whether this is a stream result.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Take the call result.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ShapeMismatch`] for a stream result.
    pub fn into_value(self) -> CapsuleResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Stream(_) => Err(CapsuleError::ShapeMismatch { expected: "call" }),
        }
    }

    /// Take the call result and deserialize it.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ShapeMismatch`] for a stream result, or
    /// [`CapsuleError::Serialization`] if the value does not fit `R`.
    pub fn into_typed<R: DeserializeOwned>(self) -> CapsuleResult<R> {
        Ok(serde_json::from_value(self.into_value()?)?)
    }

    /// Take the stream.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ShapeMismatch`] for a call result.
    pub fn into_stream(self) -> CapsuleResult<ValueStream> {
        match self {
            Self::Stream(stream) => Ok(stream),
            Self::Value(_) => Err(CapsuleError::ShapeMismatch { expected: "stream" }),
        }
    }
}

impl fmt::Debug for TriggerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}
