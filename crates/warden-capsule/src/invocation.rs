//! In-flight invocation bookkeeping.

use std::sync::Arc;

use crate::engine::Shared;

/// Removes an invocation from the in-flight set when dropped.
///
/// Held by `trigger` for the duration of a call, and by the returned
/// stream for a stream operation.
pub(crate) struct InFlightGuard {
    shared: Arc<Shared>,
    invocation: u64,
}

impl InFlightGuard {
    pub(crate) fn new(shared: Arc<Shared>, invocation: u64) -> Self {
        Self { shared, invocation }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.release(self.invocation);
    }
}
