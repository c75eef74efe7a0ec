//! Error taxonomy shared by local and remote capsule instances.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelReason;
use crate::lifecycle::LifecycleState;

/// Which half of a `capability.operation` lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundKind {
    /// The capability name is not declared by the capsule.
    Capability,
    /// The capability exists but does not declare the operation.
    Operation,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability => f.write_str("capability"),
            Self::Operation => f.write_str("operation"),
        }
    }
}

/// Errors that can occur while defining, booting, or invoking a capsule.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// A lifecycle guard was violated (trigger before boot, boot after shutdown, ...).
    #[error("illegal state ({state}): {message}")]
    IllegalState {
        /// The lifecycle state the instance was in.
        state: LifecycleState,
        /// What was attempted.
        message: String,
    },

    /// Unknown capability or operation name.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Which lookup failed.
        kind: NotFoundKind,
        /// The name that was looked up.
        name: String,
    },

    /// A middleware declined the invocation.
    #[error("rejected: {reason}")]
    Rejected {
        /// Reason supplied by the middleware.
        reason: String,
    },

    /// The invocation's cancellation token fired.
    #[error("cancelled ({reason})")]
    Cancelled {
        /// Why the token was cancelled.
        reason: CancelReason,
    },

    /// Params did not match the operation's declared parameter type.
    #[error("invalid params for operation '{operation}': {message}")]
    InvalidParams {
        /// The operation being invoked.
        operation: String,
        /// Deserialization failure description.
        message: String,
    },

    /// The operation's own handler failed.
    #[error(transparent)]
    Handler(anyhow::Error),

    /// A middleware failed (as opposed to rejecting).
    #[error(transparent)]
    Middleware(anyhow::Error),

    /// A boot or shutdown hook failed.
    #[error(transparent)]
    Hook(anyhow::Error),

    /// The capsule definition is malformed.
    #[error("invalid capsule definition: {0}")]
    InvalidDefinition(String),

    /// A call result was consumed as a stream, or vice versa.
    #[error("expected a {expected} result")]
    ShapeMismatch {
        /// The shape the caller asked for.
        expected: &'static str,
    },

    /// A wire message was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `describe()` was called on a remote instance before metadata arrived.
    #[error("capsule metadata has not been loaded yet")]
    MetadataNotLoaded,

    /// The remote transport has not been connected yet.
    #[error("connection to the remote capsule has not been established")]
    ConnectionNotEstablished,

    /// `emit()` was called on a caller-side proxy.
    #[error("stimuli cannot be emitted through a remote capsule proxy")]
    CannotEmit,

    /// The remote end went away while a request was outstanding.
    #[error("connection to the remote capsule closed")]
    ConnectionClosed,

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A control request did not complete in time.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The wire method that timed out.
        method: String,
        /// The configured deadline.
        timeout_ms: u64,
    },

    /// A value could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The remote capsule reported an error code this side does not know.
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Error code reported by the remote side.
        code: String,
        /// Error message reported by the remote side.
        message: String,
    },
}

impl CapsuleError {
    /// Build an [`CapsuleError::IllegalState`].
    pub fn illegal_state(state: LifecycleState, message: impl Into<String>) -> Self {
        Self::IllegalState {
            state,
            message: message.into(),
        }
    }

    /// The error `trigger` fails with outside the `booted` state.
    #[must_use]
    pub fn trigger_not_booted(state: LifecycleState, capability: &str, operation: &str) -> Self {
        Self::illegal_state(state, format!("cannot trigger {capability}.{operation}"))
    }

    /// The error `boot` fails with once the capsule has been shut down.
    #[must_use]
    pub fn boot_after_shutdown() -> Self {
        Self::illegal_state(
            LifecycleState::Shutdown,
            "cannot boot a capsule that has been shut down",
        )
    }

    /// The error `shutdown` fails with on a capsule that never booted.
    #[must_use]
    pub fn shutdown_before_boot() -> Self {
        Self::illegal_state(LifecycleState::Created, "capsule was never booted")
    }

    /// Build a [`CapsuleError::NotFound`] for a capability name.
    pub fn capability_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: NotFoundKind::Capability,
            name: name.into(),
        }
    }

    /// Build a [`CapsuleError::NotFound`] for an operation name.
    pub fn operation_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: NotFoundKind::Operation,
            name: name.into(),
        }
    }

    /// Build a [`CapsuleError::Rejected`].
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Convert a handler failure, unwrapping errors that already are capsule errors.
    #[must_use]
    pub fn from_handler(err: anyhow::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(inner) => inner,
            Err(err) => Self::Handler(err),
        }
    }

    /// Convert a middleware failure, unwrapping errors that already are capsule errors.
    #[must_use]
    pub fn from_middleware(err: anyhow::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(inner) => inner,
            Err(err) => Self::Middleware(err),
        }
    }

    /// Convert a lifecycle hook failure, unwrapping errors that already are capsule errors.
    #[must_use]
    pub fn from_hook(err: anyhow::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(inner) => inner,
            Err(err) => Self::Hook(err),
        }
    }

    /// Stable machine-readable code, used on the wire.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::IllegalState { .. } => "illegal_state",
            Self::NotFound { .. } => "not_found",
            Self::Rejected { .. } => "rejected",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Handler(_) => "handler",
            Self::Middleware(_) => "middleware",
            Self::Hook(_) => "hook",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::Protocol(_) => "protocol",
            Self::MetadataNotLoaded => "metadata_not_loaded",
            Self::ConnectionNotEstablished => "connection_not_established",
            Self::CannotEmit => "cannot_emit",
            Self::ConnectionClosed => "connection_closed",
            Self::Transport(_) => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Remote { code, .. } => code,
        }
    }

    /// Returns `true` for a middleware rejection.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// Returns `true` for a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// A specialized Result type for capsule operations.
pub type CapsuleResult<T> = Result<T, CapsuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DomainError;

    #[test]
    fn test_handler_error_is_transparent() {
        let err = CapsuleError::from_handler(anyhow::Error::new(DomainError));
        assert_eq!(err.to_string(), "disk on fire");
        assert_eq!(err.code(), "handler");

        let CapsuleError::Handler(inner) = err else {
            panic!("expected handler error");
        };
        assert!(inner.downcast_ref::<DomainError>().is_some());
    }

    #[test]
    fn test_capsule_error_is_not_double_wrapped() {
        let err = CapsuleError::from_handler(
            CapsuleError::Cancelled {
                reason: CancelReason::User,
            }
            .into(),
        );
        assert!(err.is_cancelled());

        let err = CapsuleError::from_middleware(CapsuleError::rejected("nope").into());
        assert!(err.is_rejected());
    }

    #[test]
    fn test_not_found_mentions_name() {
        let err = CapsuleError::capability_not_found("nope");
        assert_eq!(err.to_string(), "capability not found: nope");

        let err = CapsuleError::operation_not_found("sub");
        assert!(err.to_string().contains("sub"));
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_trigger_not_booted_names_state() {
        let err = CapsuleError::trigger_not_booted(LifecycleState::Created, "math", "add");
        assert_eq!(err.code(), "illegal_state");
        assert_eq!(err.to_string(), "illegal state (created): cannot trigger math.add");
    }

    #[test]
    fn test_remote_code_passthrough() {
        let err = CapsuleError::Remote {
            code: "E".into(),
            message: "boom".into(),
        };
        assert_eq!(err.code(), "E");
        assert!(err.to_string().contains("boom"));
    }
}
