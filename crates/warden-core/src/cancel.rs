//! Cooperative cancellation tokens that remember why they fired.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken as Signal, WaitForCancellationFutureOwned};

/// Future returned by [`CancellationToken::cancelled`].
pub type WaitForCancellation = WaitForCancellationFutureOwned;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller cancelled explicitly.
    User,
    /// The runtime cancelled it (e.g. during shutdown).
    System,
    /// A caller-side deadline expired.
    Timeout,
}

impl CancelReason {
    /// Returns the lowercase name used in messages and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Timeout => "timeout",
        }
    }

    /// Parse the lowercase wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cooperative cancellation signal carrying a [`CancelReason`].
///
/// Clones share the same signal. A [`child`](Self::child) token is cancelled
/// whenever its parent is, and reports the parent's reason in that case. The
/// link from parent to child is released when the last clone of the child is
/// dropped, so long-lived parents do not accumulate dead children.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    signal: Signal,
    reason: OnceLock<CancelReason>,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    /// Create a fresh, uncancelled root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                signal: Signal::new(),
                reason: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Create a token that is cancelled whenever `self` is.
    ///
    /// Cancelling the child does not affect the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                signal: self.inner.signal.child_token(),
                reason: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel the token. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.inner.reason.set(reason);
        self.inner.signal.cancel();
    }

    /// Whether the token (or any ancestor) has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.signal.is_cancelled()
    }

    /// The reason the token was cancelled, if it has been.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.inner.reason.get() {
            return Some(*reason);
        }
        if !self.is_cancelled() {
            return None;
        }
        self.inner
            .parent
            .as_ref()
            .and_then(CancellationToken::reason)
    }

    /// A `'static` future that resolves once the token is cancelled.
    #[must_use]
    pub fn cancelled(&self) -> WaitForCancellation {
        self.inner.signal.clone().cancelled_owned()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish_non_exhaustive()
    }
}
