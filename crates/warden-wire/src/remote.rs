//! A capsule instance that lives on the other end of a transport.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use warden_capsule::{CapsuleInstance, Listener, Subscription};
use warden_config::WireConfig;
use warden_core::{
    CancelReason, CancellationToken, CapsuleError, CapsuleResult, ExecutionShape, LifecycleState,
    Metadata, TriggerOutput, ValueStream,
};

use crate::handler::{ProtocolHandler, StreamEvent, StreamRoute};
use crate::message::method;
use crate::transport::Transport;

/// Drives a capsule hosted in another process or on another machine.
///
/// Observably identical to a [`warden_capsule::LocalInstance`]: lifecycle
/// guards run locally before anything touches the network, and remote
/// errors are rebuilt into the same [`CapsuleError`] variants.
pub struct RemoteInstance {
    transport: tokio::sync::Mutex<Box<dyn Transport>>,
    handler: OnceLock<Arc<ProtocolHandler>>,
    metadata: OnceLock<Metadata>,
    state: Mutex<LifecycleState>,
    lifecycle: tokio::sync::Mutex<()>,
    config: WireConfig,
}

impl RemoteInstance {
    /// Create an unconnected instance. Call [`connect`](Self::connect)
    /// before use.
    pub fn new(transport: impl Transport + 'static, config: WireConfig) -> Self {
        Self::from_boxed(Box::new(transport), config)
    }

    /// Create an unconnected instance from a boxed transport.
    #[must_use]
    pub fn from_boxed(transport: Box<dyn Transport>, config: WireConfig) -> Self {
        Self {
            transport: tokio::sync::Mutex::new(transport),
            handler: OnceLock::new(),
            metadata: OnceLock::new(),
            state: Mutex::new(LifecycleState::Created),
            lifecycle: tokio::sync::Mutex::new(()),
            config,
        }
    }

    /// Open the transport and fetch capsule metadata.
    ///
    /// Safe to call again after a failed metadata fetch.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or the error of the `describe` request.
    pub async fn connect(&self) -> CapsuleResult<()> {
        let mut transport = self.transport.lock().await;

        if self.handler.get().is_none() {
            let (reader, writer) = transport.open().await?;
            let handler = ProtocolHandler::new(reader, writer, self.config.max_line_bytes);
            let _ = self.handler.set(Arc::new(handler));
            debug!("Remote capsule transport opened");
        }

        if self.metadata.get().is_none() {
            let value = self.control(method::DESCRIBE).await?;
            let metadata: Metadata = serde_json::from_value(value)?;
            info!(capsule = %metadata.name, id = %metadata.id, "Connected to remote capsule");
            let _ = self.metadata.set(metadata);
        }
        Ok(())
    }

    /// The protocol handler, once connected.
    #[must_use]
    pub fn handler(&self) -> Option<&Arc<ProtocolHandler>> {
        self.handler.get()
    }

    /// Lifecycle state as tracked on this side.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn connected(&self) -> CapsuleResult<&Arc<ProtocolHandler>> {
        self.handler.get().ok_or(CapsuleError::ConnectionNotEstablished)
    }

    /// Send a control request under the configured deadline.
    async fn control(&self, name: &str) -> CapsuleResult<Value> {
        self.connected()?
            .request(name, Value::Null, self.config.request_timeout())
            .await
    }
}

#[async_trait]
impl CapsuleInstance for RemoteInstance {
    fn describe(&self) -> CapsuleResult<Metadata> {
        self.metadata
            .get()
            .cloned()
            .ok_or(CapsuleError::MetadataNotLoaded)
    }

    async fn boot(&self) -> CapsuleResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            LifecycleState::Booted => return Ok(()),
            LifecycleState::Shutdown => return Err(CapsuleError::boot_after_shutdown()),
            LifecycleState::Created => {},
        }

        self.control(method::BOOT).await?;
        self.set_state(LifecycleState::Booted);
        info!("Remote capsule booted");
        Ok(())
    }

    async fn shutdown(&self) -> CapsuleResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            LifecycleState::Shutdown => return Ok(()),
            LifecycleState::Created => return Err(CapsuleError::shutdown_before_boot()),
            LifecycleState::Booted => {},
        }

        let result = self.control(method::SHUTDOWN).await.map(|_| ());
        self.set_state(LifecycleState::Shutdown);
        if let Some(handler) = self.handler.get() {
            handler.listeners().clear();
        }
        match &result {
            Ok(()) => info!("Remote capsule shut down"),
            Err(e) => warn!(error = %e, "Remote capsule shut down; shutdown reported an error"),
        }
        result
    }

    async fn trigger(
        &self,
        capability: &str,
        operation: &str,
        params: Value,
        cancel: Option<CancellationToken>,
    ) -> CapsuleResult<TriggerOutput> {
        let state = self.state();
        if state != LifecycleState::Booted {
            return Err(CapsuleError::trigger_not_booted(state, capability, operation));
        }
        if let Some(token) = &cancel
            && token.is_cancelled()
        {
            return Err(CapsuleError::Cancelled {
                reason: token.reason().unwrap_or(CancelReason::User),
            });
        }

        let handler = Arc::clone(self.connected()?);
        let id = handler.next_request_id();
        let is_stream = self
            .metadata
            .get()
            .and_then(|m| m.operation_kind(capability, operation))
            == Some(ExecutionShape::Stream);
        let route = is_stream.then(|| handler.open_stream(id));

        let pending = handler.send(
            id,
            method::TRIGGER,
            json!({
                "capability": capability,
                "operation": operation,
                "params": params,
            }),
        )?;
        debug!(request_id = id, capability, operation, "Remote trigger");

        let wait = pending.wait();
        tokio::pin!(wait);
        let outcome = match &cancel {
            None => wait.await,
            Some(token) => tokio::select! {
                outcome = &mut wait => outcome,
                () = token.cancelled() => {
                    send_cancel(&handler, id, token.reason());
                    wait.await
                },
            },
        };
        let value = outcome?;

        match route {
            None => Ok(TriggerOutput::Value(value)),
            Some(route) => {
                if value.get("stream").and_then(Value::as_u64) != Some(id) {
                    return Err(CapsuleError::Protocol(format!(
                        "expected a stream handle for request {id}, got {value}"
                    )));
                }
                Ok(TriggerOutput::Stream(remote_stream(handler, route, cancel)))
            },
        }
    }

    fn emit(&self, _sense: &str, _data: Value) -> CapsuleResult<()> {
        Err(CapsuleError::CannotEmit)
    }

    fn on_stimulus(&self, listener: Listener) -> CapsuleResult<Subscription> {
        Ok(self.connected()?.listeners().subscribe(listener))
    }
}

impl fmt::Debug for RemoteInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteInstance")
            .field("capsule", &self.metadata.get().map(|m| m.name.as_str()))
            .field("state", &self.state())
            .field("connected", &self.handler.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Ask the host to cancel `invocation` without waiting for the answer.
fn send_cancel(handler: &ProtocolHandler, invocation: u64, reason: Option<CancelReason>) {
    let reason = reason.unwrap_or(CancelReason::User);
    debug!(invocation, %reason, "Cancelling remote invocation");
    let params = json!({ "invocation": invocation, "reason": reason.as_str() });
    match handler.send(handler.next_request_id(), method::CANCEL, params) {
        Ok(pending) => pending.detach(),
        Err(e) => debug!(invocation, error = %e, "Cancel not sent"),
    }
}

/// Sends `cancel` for the stream if it is dropped before it ends.
struct CancelOnDrop {
    handler: Arc<ProtocolHandler>,
    invocation: u64,
    reason: Option<CancelReason>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && !self.handler.is_closed() {
            send_cancel(&self.handler, self.invocation, self.reason);
        }
    }
}

struct RemoteStream {
    route: StreamRoute,
    cancel: Option<CancellationToken>,
    guard: CancelOnDrop,
    finished: bool,
}

fn remote_stream(
    handler: Arc<ProtocolHandler>,
    route: StreamRoute,
    cancel: Option<CancellationToken>,
) -> ValueStream {
    let invocation = route.id();
    let state = RemoteStream {
        route,
        cancel,
        guard: CancelOnDrop {
            handler,
            invocation,
            reason: None,
            armed: true,
        },
        finished: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        let event = match &st.cancel {
            None => st.route.recv().await,
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => {
                    st.guard.reason = token.reason();
                    return None;
                },
                event = st.route.recv() => event,
            },
        };

        match event {
            Some(StreamEvent::Item(value)) => Some((Ok(value), st)),
            Some(StreamEvent::End) | None => {
                st.guard.armed = false;
                None
            },
            Some(StreamEvent::Error(e)) => {
                st.guard.armed = false;
                st.finished = true;
                Some((Err(e), st))
            },
        }
    })
    .fuse()
    .boxed()
}
