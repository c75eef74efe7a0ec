//! Stimuli: ambient capsule-to-caller events.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CapsuleResult;

/// The operation a stimulus was emitted from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StimulusSource {
    /// Capability name.
    pub capability: String,
    /// Operation name within the capability.
    pub operation: String,
}

impl StimulusSource {
    /// Create a new source descriptor.
    pub fn new(capability: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            operation: operation.into(),
        }
    }
}

/// An ambient event emitted by a capsule.
///
/// `timestamp` and `source` are always assigned by the runtime, never by
/// the code that called `emit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    /// Sense name (the event's kind).
    pub sense: String,
    /// Opaque payload.
    pub data: Value,
    /// Present only for stimuli emitted from inside an operation handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StimulusSource>,
    /// When the runtime accepted the emission.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Stimulus {
    /// Create a stimulus stamped with the current time.
    pub fn now(sense: impl Into<String>, data: Value, source: Option<StimulusSource>) -> Self {
        Self {
            sense: sense.into(),
            data,
            source,
            timestamp: Utc::now(),
        }
    }
}

/// Where an emission came from. Decides whether it is accepted and which
/// provenance it is stamped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOrigin {
    /// A boot or shutdown hook.
    Lifecycle,
    /// An operation handler.
    Operation(StimulusSource),
    /// The owner of the instance, calling `emit` directly.
    Instance,
}

impl EmitOrigin {
    /// The provenance a stimulus from this origin carries.
    #[must_use]
    pub fn source(&self) -> Option<&StimulusSource> {
        match self {
            Self::Operation(source) => Some(source),
            Self::Lifecycle | Self::Instance => None,
        }
    }
}

/// Receives emissions on behalf of a running capsule.
///
/// The sink decides whether an emission is accepted (based on lifecycle
/// state) and builds the [`Stimulus`].
pub trait StimulusSink: Send + Sync {
    /// Deliver one emission.
    fn deliver(&self, origin: &EmitOrigin, sense: String, data: Value);
}

/// The `emit` affordance handed to handlers and lifecycle hooks.
///
/// The origin is fixed when the emitter is created by the runtime, so a
/// handler cannot claim to be a different operation.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn StimulusSink>,
    origin: EmitOrigin,
}

impl Emitter {
    /// Bind a sink to an origin. Called by the runtime.
    #[must_use]
    pub fn new(sink: Arc<dyn StimulusSink>, origin: EmitOrigin) -> Self {
        Self { sink, origin }
    }

    /// Emit a stimulus.
    pub fn emit(&self, sense: impl Into<String>, data: Value) {
        self.sink.deliver(&self.origin, sense.into(), data);
    }

    /// Serialize `data` and emit it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CapsuleError::Serialization`] if `data` cannot be
    /// converted to JSON.
    pub fn emit_json<T: Serialize + ?Sized>(
        &self,
        sense: impl Into<String>,
        data: &T,
    ) -> CapsuleResult<()> {
        let value = serde_json::to_value(data)?;
        self.emit(sense, value);
        Ok(())
    }

    /// The origin this emitter stamps onto stimuli.
    #[must_use]
    pub fn origin(&self) -> &EmitOrigin {
        &self.origin
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        seen: Mutex<Vec<(EmitOrigin, String, Value)>>,
    }

    impl StimulusSink for CollectingSink {
        fn deliver(&self, origin: &EmitOrigin, sense: String, data: Value) {
            self.seen.lock().unwrap().push((origin.clone(), sense, data));
        }
    }

    #[test]
    fn test_emitter_forwards_fixed_origin() {
        let sink = Arc::new(CollectingSink::default());
        let origin = EmitOrigin::Operation(StimulusSource::new("fs", "watch"));
        let emitter = Emitter::new(Arc::clone(&sink) as Arc<dyn StimulusSink>, origin.clone());

        emitter.emit("changed", json!({"path": "/tmp"}));
        emitter.emit_json("changed", &vec![1, 2]).unwrap();

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, origin);
        assert_eq!(seen[1].2, json!([1, 2]));
    }

    #[test]
    fn test_stimulus_wire_timestamp_is_millis() {
        let stimulus = Stimulus {
            sense: "tick".into(),
            data: Value::Null,
            source: None,
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        };

        let json = serde_json::to_value(&stimulus).unwrap();
        assert_eq!(json["timestamp"], json!(1_700_000_000_123_i64));
        assert!(json.get("source").is_none());
    }
}
