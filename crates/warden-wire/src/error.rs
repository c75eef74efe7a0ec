//! Protocol-level errors and the wire form of [`CapsuleError`].

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use warden_core::{CancelReason, CapsuleError, LifecycleState, NotFoundKind};

/// A malformed or unexpected inbound line.
///
/// These never fail a caller's in-flight request. They are logged and
/// published on the diagnostics channel, and the reader moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The line is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The line is JSON but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// A required field is absent.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A field has the wrong type.
    #[error("invalid field '{field}': {message}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// The object is none of request, response, or stimulus.
    #[error("unrecognized message shape")]
    Unrecognized,

    /// The line exceeded the configured limit and was discarded.
    #[error("line exceeds {limit} bytes")]
    LineTooLong {
        /// The configured limit.
        limit: usize,
    },

    /// The line is not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    /// A response arrived for an id with no pending request.
    #[error("response for unknown request id {0}")]
    UnmatchedResponse(u64),
}

/// The `error` member of a failed response.
///
/// `data` carries what the receiving side needs to rebuild the same
/// [`CapsuleError`] variant the sending side raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable machine-readable code (see [`CapsuleError::code`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    /// Create an error without structured details.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Rebuild the [`CapsuleError`] this wire error describes.
    ///
    /// Codes this side does not know, and known codes whose details are
    /// missing, become [`CapsuleError::Remote`].
    #[must_use]
    pub fn into_capsule_error(self) -> CapsuleError {
        let data = self.data.as_ref();
        let str_field = |key: &str| data.and_then(|d| d.get(key)).and_then(Value::as_str);
        let detail = str_field("detail").map(str::to_owned);

        let rebuilt = match self.code.as_str() {
            "illegal_state" => str_field("state")
                .and_then(LifecycleState::parse)
                .zip(detail)
                .map(|(state, message)| CapsuleError::IllegalState { state, message }),
            "not_found" => {
                let kind = match str_field("kind") {
                    Some("capability") => Some(NotFoundKind::Capability),
                    Some("operation") => Some(NotFoundKind::Operation),
                    _ => None,
                };
                kind.zip(str_field("name")).map(|(kind, name)| CapsuleError::NotFound {
                    kind,
                    name: name.to_owned(),
                })
            },
            "rejected" => str_field("reason").map(CapsuleError::rejected),
            "cancelled" => str_field("reason")
                .and_then(CancelReason::parse)
                .map(|reason| CapsuleError::Cancelled { reason }),
            "invalid_params" => str_field("operation").zip(detail).map(|(operation, message)| {
                CapsuleError::InvalidParams {
                    operation: operation.to_owned(),
                    message,
                }
            }),
            "shape_mismatch" => match str_field("expected") {
                Some("call") => Some(CapsuleError::ShapeMismatch { expected: "call" }),
                Some("stream") => Some(CapsuleError::ShapeMismatch { expected: "stream" }),
                _ => None,
            },
            "timeout" => str_field("method")
                .zip(data.and_then(|d| d.get("timeout_ms")).and_then(Value::as_u64))
                .map(|(method, timeout_ms)| CapsuleError::Timeout {
                    method: method.to_owned(),
                    timeout_ms,
                }),
            "handler" => Some(CapsuleError::Handler(anyhow::anyhow!(self.message.clone()))),
            "middleware" => Some(CapsuleError::Middleware(anyhow::anyhow!(
                self.message.clone()
            ))),
            "hook" => Some(CapsuleError::Hook(anyhow::anyhow!(self.message.clone()))),
            "invalid_definition" => detail.map(CapsuleError::InvalidDefinition),
            "protocol" => detail.map(CapsuleError::Protocol),
            "transport" => detail.map(CapsuleError::Transport),
            "serialization" => detail
                .map(|d| CapsuleError::Serialization(serde::de::Error::custom(d))),
            "metadata_not_loaded" => Some(CapsuleError::MetadataNotLoaded),
            "connection_not_established" => Some(CapsuleError::ConnectionNotEstablished),
            "cannot_emit" => Some(CapsuleError::CannotEmit),
            "connection_closed" => Some(CapsuleError::ConnectionClosed),
            _ => None,
        };

        rebuilt.unwrap_or(CapsuleError::Remote {
            code: self.code,
            message: self.message,
        })
    }
}

impl From<&CapsuleError> for WireError {
    fn from(err: &CapsuleError) -> Self {
        let data = match err {
            CapsuleError::IllegalState { state, message } => {
                Some(json!({ "state": state.as_str(), "detail": message }))
            },
            CapsuleError::NotFound { kind, name } => {
                Some(json!({ "kind": kind.to_string(), "name": name }))
            },
            CapsuleError::Rejected { reason } => Some(json!({ "reason": reason })),
            CapsuleError::Cancelled { reason } => Some(json!({ "reason": reason.as_str() })),
            CapsuleError::InvalidParams { operation, message } => {
                Some(json!({ "operation": operation, "detail": message }))
            },
            CapsuleError::ShapeMismatch { expected } => Some(json!({ "expected": expected })),
            CapsuleError::Timeout { method, timeout_ms } => {
                Some(json!({ "method": method, "timeout_ms": timeout_ms }))
            },
            CapsuleError::InvalidDefinition(detail)
            | CapsuleError::Protocol(detail)
            | CapsuleError::Transport(detail) => Some(json!({ "detail": detail })),
            CapsuleError::Serialization(e) => Some(json!({ "detail": e.to_string() })),
            _ => None,
        };

        let message = match err {
            CapsuleError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };

        Self {
            code: err.code().to_owned(),
            message,
            data,
        }
    }
}

impl From<CapsuleError> for WireError {
    fn from(err: CapsuleError) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(err: CapsuleError) -> CapsuleError {
        let wire = WireError::from(&err);
        let json = serde_json::to_string(&wire).unwrap();
        serde_json::from_str::<WireError>(&json)
            .unwrap()
            .into_capsule_error()
    }

    #[test]
    fn test_structured_errors_survive_the_wire() {
        let cases = [
            CapsuleError::trigger_not_booted(LifecycleState::Created, "math", "add"),
            CapsuleError::capability_not_found("nope"),
            CapsuleError::operation_not_found("sub"),
            CapsuleError::rejected("too large"),
            CapsuleError::Cancelled {
                reason: CancelReason::System,
            },
            CapsuleError::InvalidParams {
                operation: "add".into(),
                message: "missing field `a`".into(),
            },
        ];

        for err in cases {
            let code = err.code().to_owned();
            let display = err.to_string();
            let back = round_trip(err);
            assert_eq!(back.code(), code);
            assert_eq!(back.to_string(), display);
        }
    }

    #[test]
    fn test_handler_error_keeps_its_message() {
        let err = CapsuleError::from_handler(anyhow::anyhow!("disk on fire"));
        let back = round_trip(err);
        assert_eq!(back.code(), "handler");
        assert_eq!(back.to_string(), "disk on fire");
    }

    #[test]
    fn test_unknown_code_becomes_remote() {
        let err = WireError::new("E", "boom").into_capsule_error();
        assert!(matches!(&err, CapsuleError::Remote { code, .. } if code == "E"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_known_code_without_details_becomes_remote() {
        let err = WireError::new("not_found", "capability not found: x").into_capsule_error();
        assert_eq!(err.code(), "not_found");
        assert!(matches!(err, CapsuleError::Remote { .. }));
    }

    #[test]
    fn test_remote_error_is_not_double_prefixed() {
        let wire = WireError::from(&CapsuleError::Remote {
            code: "E".into(),
            message: "boom".into(),
        });
        assert_eq!(wire.message, "boom");
        assert!(wire.data.is_none());
    }
}
