//! Mock listeners and middleware for testing.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use warden_capsule::Listener;
use warden_core::{Decision, InvocationContext, Middleware, Stimulus};

/// Captures every stimulus delivered to it.
///
/// Remote stimuli arrive on the reader task, so use
/// [`wait_for`](Self::wait_for) rather than asserting immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    received: Arc<Mutex<Vec<Stimulus>>>,
    notify: Arc<Notify>,
}

impl RecordingListener {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A listener that records into this recorder.
    #[must_use]
    pub fn listener(&self) -> Listener {
        let recorder = self.clone();
        Arc::new(move |stimulus: &Stimulus| {
            recorder
                .received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(stimulus.clone());
            recorder.notify.notify_waiters();
        })
    }

    /// Everything received so far, in delivery order.
    #[must_use]
    pub fn stimuli(&self) -> Vec<Stimulus> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Senses received so far, in delivery order.
    #[must_use]
    pub fn senses(&self) -> Vec<String> {
        self.stimuli().into_iter().map(|s| s.sense).collect()
    }

    /// Number of stimuli received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` stimuli were received.
    ///
    /// Returns `false` if `timeout` passes first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let waiting = async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, waiting).await.is_ok()
    }
}

/// Records the order in which middleware and handlers run.
#[derive(Debug, Clone, Default)]
pub struct OrderProbe {
    calls: Arc<Mutex<Vec<String>>>,
}

impl OrderProbe {
    /// Create an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `label`.
    pub fn record(&self, label: impl Into<String>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(label.into());
    }

    /// Labels recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Middleware that records `label` and accepts.
    #[must_use]
    pub fn middleware<P>(&self, label: impl Into<String>) -> ProbeMiddleware<P> {
        ProbeMiddleware {
            probe: self.clone(),
            label: label.into(),
            decision: ProbeDecision::Accept,
            _params: PhantomData,
        }
    }

    /// Middleware that records `label` and rejects with `reason`.
    #[must_use]
    pub fn rejecting<P>(
        &self,
        label: impl Into<String>,
        reason: impl Into<String>,
    ) -> ProbeMiddleware<P> {
        ProbeMiddleware {
            probe: self.clone(),
            label: label.into(),
            decision: ProbeDecision::Reject(reason.into()),
            _params: PhantomData,
        }
    }
}

#[derive(Debug, Clone)]
enum ProbeDecision {
    Accept,
    Reject(String),
}

/// Middleware created by [`OrderProbe`].
#[derive(Debug)]
pub struct ProbeMiddleware<P> {
    probe: OrderProbe,
    label: String,
    decision: ProbeDecision,
    _params: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P> Middleware<P> for ProbeMiddleware<P>
where
    P: Send + Sync + 'static,
{
    async fn check(&self, _ctx: &InvocationContext<'_, P>) -> anyhow::Result<Decision<P>> {
        self.probe.record(self.label.clone());
        Ok(match &self.decision {
            ProbeDecision::Accept => Decision::accept(),
            ProbeDecision::Reject(reason) => Decision::reject(reason.clone()),
        })
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_recording_listener_wakes_waiters() {
        let recorder = RecordingListener::new();
        let listener = recorder.listener();

        let waiter = tokio::spawn({
            let recorder = recorder.clone();
            async move { recorder.wait_for(2, Duration::from_secs(5)).await }
        });
        tokio::task::yield_now().await;

        listener(&Stimulus::now("a", json!(1), None));
        listener(&Stimulus::now("b", json!(2), None));

        assert!(waiter.await.unwrap());
        assert_eq!(recorder.senses(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let recorder = RecordingListener::new();
        assert!(!recorder.wait_for(1, Duration::from_millis(10)).await);
        assert!(recorder.is_empty());
    }

    #[tokio::test]
    async fn test_probe_middleware_records_and_decides() {
        let probe = OrderProbe::new();
        let cancel = warden_core::CancellationToken::new();
        let params = Value::Null;
        let ctx = InvocationContext {
            capability: "math",
            operation: "add",
            params: &params,
            cancel: &cancel,
        };

        let accept: ProbeMiddleware<Value> = probe.middleware("A");
        let reject: ProbeMiddleware<Value> = probe.rejecting("B", "policy");

        assert_eq!(accept.check(&ctx).await.unwrap(), Decision::Accept);
        assert!(reject.check(&ctx).await.unwrap().is_reject());
        assert_eq!(probe.calls(), vec!["A", "B"]);
    }
}
