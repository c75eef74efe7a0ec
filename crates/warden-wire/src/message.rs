//! The three message shapes that share one JSONL stream.
//!
//! - request: `{"id", "method", "params"}`, caller to capsule
//! - response: `{"id", "result"}` or `{"id", "error"}`, capsule to caller
//! - stimulus: `{"type": "stimulus", "sense", "data", "source", "timestamp"}`,
//!   capsule to caller, never correlated with a request
//!
//! Shapes are told apart by structure, not by an envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use warden_core::{Stimulus, StimulusSource};

use crate::error::{ProtocolError, WireError};

/// Sense of a stream item event.
pub const STREAM_ITEM: &str = "$stream.item";
/// Sense of the event that ends a stream normally.
pub const STREAM_END: &str = "$stream.end";
/// Sense of the event that ends a stream with an error.
pub const STREAM_ERROR: &str = "$stream.error";

/// Wire method names.
pub mod method {
    /// Fetch capsule metadata.
    pub const DESCRIBE: &str = "describe";
    /// Boot the capsule.
    pub const BOOT: &str = "boot";
    /// Shut the capsule down.
    pub const SHUTDOWN: &str = "shutdown";
    /// Invoke an operation.
    pub const TRIGGER: &str = "trigger";
    /// Cancel an in-flight invocation.
    pub const CANCEL: &str = "cancel";
}

/// A caller-to-capsule request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id, unique per connection.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method params (`null` when absent).
    pub params: Value,
}

/// A capsule-to-caller response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The id of the request being answered.
    pub id: u64,
    /// `result` or `error`.
    pub outcome: Result<Value, WireError>,
}

/// Provenance of a stimulus on the wire.
///
/// `invocation` is set only on stream events, where it is the id of the
/// `trigger` request that opened the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSource {
    /// Capability name.
    pub capability: String,
    /// Operation name.
    pub operation: String,
    /// Stream correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<u64>,
}

/// A stimulus event as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireStimulus {
    /// Sense name.
    pub sense: String,
    /// Payload.
    pub data: Value,
    /// Provenance, if any.
    pub source: Option<WireSource>,
    /// Emission time. Receipt time if the sender omitted it.
    pub timestamp: DateTime<Utc>,
}

impl WireStimulus {
    /// A stream event for `invocation`.
    #[must_use]
    pub fn stream_event(
        sense: &str,
        data: Value,
        capability: &str,
        operation: &str,
        invocation: u64,
    ) -> Self {
        Self {
            sense: sense.to_owned(),
            data,
            source: Some(WireSource {
                capability: capability.to_owned(),
                operation: operation.to_owned(),
                invocation: Some(invocation),
            }),
            timestamp: Utc::now(),
        }
    }

    /// The stream this event belongs to, if it is a stream event.
    #[must_use]
    pub fn stream_invocation(&self) -> Option<u64> {
        if !self.sense.starts_with("$stream.") {
            return None;
        }
        self.source.as_ref().and_then(|s| s.invocation)
    }

    /// Convert into the caller-facing [`Stimulus`].
    #[must_use]
    pub fn into_stimulus(self) -> Stimulus {
        Stimulus {
            sense: self.sense,
            data: self.data,
            source: self
                .source
                .map(|s| StimulusSource::new(s.capability, s.operation)),
            timestamp: self.timestamp,
        }
    }
}

impl From<&Stimulus> for WireStimulus {
    fn from(stimulus: &Stimulus) -> Self {
        Self {
            sense: stimulus.sense.clone(),
            data: stimulus.data.clone(),
            source: stimulus.source.as_ref().map(|s| WireSource {
                capability: s.capability.clone(),
                operation: s.operation.clone(),
                invocation: None,
            }),
            timestamp: stimulus.timestamp,
        }
    }
}

/// Any message on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Caller to capsule.
    Request(Request),
    /// Capsule to caller, correlated.
    Response(Response),
    /// Capsule to caller, uncorrelated.
    Stimulus(WireStimulus),
}

impl WireMessage {
    /// Parse one line.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing why the line is not a valid
    /// message.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if obj.get("type").and_then(Value::as_str) == Some("stimulus") {
            return parse_stimulus(obj).map(Self::Stimulus);
        }

        if obj.contains_key("method") {
            let id = parse_id(&obj)?;
            let method = match obj.remove("method") {
                Some(Value::String(method)) => method,
                _ => {
                    return Err(ProtocolError::InvalidField {
                        field: "method",
                        message: "expected a string".to_owned(),
                    });
                },
            };
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Ok(Self::Request(Request { id, method, params }));
        }

        if obj.contains_key("id") {
            if let Some(error) = obj.remove("error") {
                let id = parse_id(&obj)?;
                let error: WireError =
                    serde_json::from_value(error).map_err(|e| ProtocolError::InvalidField {
                        field: "error",
                        message: e.to_string(),
                    })?;
                return Ok(Self::Response(Response {
                    id,
                    outcome: Err(error),
                }));
            }
            if let Some(result) = obj.remove("result") {
                let id = parse_id(&obj)?;
                return Ok(Self::Response(Response {
                    id,
                    outcome: Ok(result),
                }));
            }
        }

        Err(ProtocolError::Unrecognized)
    }

    /// Encode as one line, without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        let value = match self {
            Self::Request(req) => json!({
                "id": req.id,
                "method": req.method,
                "params": req.params,
            }),
            Self::Response(Response {
                id,
                outcome: Ok(result),
            }) => json!({ "id": id, "result": result }),
            Self::Response(Response {
                id,
                outcome: Err(error),
            }) => json!({ "id": id, "error": error }),
            Self::Stimulus(s) => json!({
                "type": "stimulus",
                "sense": s.sense,
                "data": s.data,
                "source": s.source,
                "timestamp": s.timestamp.timestamp_millis(),
            }),
        };
        value.to_string()
    }
}

/// Accept a non-negative integer id, or a string holding one.
fn parse_id(obj: &Map<String, Value>) -> Result<u64, ProtocolError> {
    let id = obj.get("id").ok_or(ProtocolError::MissingField("id"))?;
    id.as_u64()
        .or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| ProtocolError::InvalidField {
            field: "id",
            message: format!("expected a non-negative integer, got {id}"),
        })
}

fn parse_stimulus(mut obj: Map<String, Value>) -> Result<WireStimulus, ProtocolError> {
    let sense = match obj.remove("sense") {
        Some(Value::String(sense)) => sense,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "sense",
                message: "expected a string".to_owned(),
            });
        },
        None => return Err(ProtocolError::MissingField("sense")),
    };
    let data = obj.remove("data").unwrap_or(Value::Null);

    let source = match obj.remove("source") {
        None | Some(Value::Null) => None,
        Some(source) => Some(serde_json::from_value::<WireSource>(source).map_err(|e| {
            ProtocolError::InvalidField {
                field: "source",
                message: e.to_string(),
            }
        })?),
    };

    let timestamp = match obj.get("timestamp") {
        None | Some(Value::Null) => Utc::now(),
        Some(ts) => ts
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "timestamp",
                message: "expected integer milliseconds since the Unix epoch".to_owned(),
            })?,
    };

    Ok(WireStimulus {
        sense,
        data,
        source,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_response() {
        let msg = WireMessage::parse(r#"{"id":1,"result":42}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::Response(Response {
                id: 1,
                outcome: Ok(json!(42)),
            })
        );
    }

    #[test]
    fn test_parse_error_response() {
        let msg = WireMessage::parse(r#"{"id":1,"error":{"code":"E","message":"boom"}}"#).unwrap();
        let WireMessage::Response(Response {
            id: 1,
            outcome: Err(error),
        }) = msg
        else {
            panic!("expected an error response");
        };
        assert_eq!(error.code, "E");
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn test_null_result_is_still_a_response() {
        let line = WireMessage::Response(Response {
            id: 9,
            outcome: Ok(Value::Null),
        })
        .to_line();
        assert_eq!(line, r#"{"id":9,"result":null}"#);
        assert!(matches!(
            WireMessage::parse(&line).unwrap(),
            WireMessage::Response(Response { id: 9, outcome: Ok(Value::Null) })
        ));
    }

    #[test]
    fn test_string_id_is_accepted() {
        let msg = WireMessage::parse(r#"{"id":"7","method":"boot"}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::Request(Request {
                id: 7,
                method: "boot".into(),
                params: Value::Null,
            })
        );
    }

    #[test]
    fn test_parse_stimulus_with_and_without_source() {
        let msg = WireMessage::parse(
            r#"{"type":"stimulus","sense":"tick","data":{"n":1},"source":null,"timestamp":1700000000000}"#,
        )
        .unwrap();
        let WireMessage::Stimulus(s) = msg else {
            panic!("expected a stimulus");
        };
        assert_eq!(s.sense, "tick");
        assert!(s.source.is_none());
        assert_eq!(s.timestamp.timestamp_millis(), 1_700_000_000_000);

        let msg = WireMessage::parse(
            r#"{"type":"stimulus","sense":"$stream.item","data":3,"source":{"capability":"seq","operation":"count","invocation":4}}"#,
        )
        .unwrap();
        let WireMessage::Stimulus(s) = msg else {
            panic!("expected a stimulus");
        };
        assert_eq!(s.stream_invocation(), Some(4));
    }

    #[test]
    fn test_ordinary_sense_is_not_a_stream_event() {
        let mut event = WireStimulus::stream_event(STREAM_ITEM, json!(1), "a", "b", 3);
        assert_eq!(event.stream_invocation(), Some(3));
        event.sense = "changed".into();
        assert_eq!(event.stream_invocation(), None);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            WireMessage::parse("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(WireMessage::parse("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_eq!(
            WireMessage::parse(r#"{"hello":"world"}"#),
            Err(ProtocolError::Unrecognized)
        );
        assert_eq!(
            WireMessage::parse(r#"{"type":"stimulus","data":1}"#),
            Err(ProtocolError::MissingField("sense"))
        );
        assert!(matches!(
            WireMessage::parse(r#"{"id":-1,"result":1}"#),
            Err(ProtocolError::InvalidField { field: "id", .. })
        ));
    }

    #[test]
    fn test_stimulus_line_keeps_provenance() {
        let stimulus = Stimulus::now("changed", json!({"k": 1}), Some(StimulusSource::new("fs", "watch")));
        let line = WireMessage::Stimulus(WireStimulus::from(&stimulus)).to_line();
        let WireMessage::Stimulus(back) = WireMessage::parse(&line).unwrap() else {
            panic!("expected a stimulus");
        };
        let back = back.into_stimulus();
        assert_eq!(back.source, stimulus.source);
        assert_eq!(
            back.timestamp.timestamp_millis(),
            stimulus.timestamp.timestamp_millis()
        );
    }
}
