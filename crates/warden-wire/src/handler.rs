//! Caller-side protocol handler: request correlation, stimulus fan-out and
//! stream routing over one JSONL connection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use warden_capsule::ListenerRegistry;
use warden_core::{CapsuleError, CapsuleResult};

use crate::error::{ProtocolError, WireError};
use crate::framing::{Frame, LineReader, LineWriter};
use crate::message::{
    Request, Response, STREAM_END, STREAM_ERROR, STREAM_ITEM, WireMessage, WireStimulus,
};

/// Capacity of the diagnostics broadcast channel.
const DIAGNOSTICS_CAPACITY: usize = 64;

/// One event on a routed stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// The next item.
    Item(Value),
    /// The stream finished normally.
    End,
    /// The stream failed. No further events follow.
    Error(CapsuleError),
}

type PendingSender = oneshot::Sender<CapsuleResult<Value>>;

struct Inner {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingSender>,
    streams: DashMap<u64, mpsc::UnboundedSender<StreamEvent>>,
    listeners: ListenerRegistry,
    diagnostics: broadcast::Sender<ProtocolError>,
    outbound: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

impl Inner {
    fn handle_line(&self, line: &str) {
        let message = match WireMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                self.report(e);
                return;
            },
        };

        match message {
            WireMessage::Response(Response { id, outcome }) => {
                let Some((_, tx)) = self.pending.remove(&id) else {
                    self.report(ProtocolError::UnmatchedResponse(id));
                    return;
                };
                trace!(request_id = id, ok = outcome.is_ok(), "Response received");
                let _ = tx.send(outcome.map_err(WireError::into_capsule_error));
            },
            WireMessage::Stimulus(stimulus) => match stimulus.stream_invocation() {
                Some(invocation) => self.route_stream_event(invocation, stimulus),
                None => self.listeners.notify(&stimulus.into_stimulus()),
            },
            WireMessage::Request(Request { id, method, .. }) => {
                debug!(request_id = id, %method, "Ignoring request sent to the caller side");
                self.report(ProtocolError::Unrecognized);
            },
        }
    }

    fn route_stream_event(&self, invocation: u64, stimulus: WireStimulus) {
        let event = match stimulus.sense.as_str() {
            STREAM_ITEM => StreamEvent::Item(stimulus.data),
            STREAM_END => StreamEvent::End,
            STREAM_ERROR => {
                let error = serde_json::from_value::<WireError>(stimulus.data)
                    .map_or_else(
                        |e| CapsuleError::Protocol(format!("malformed stream error: {e}")),
                        WireError::into_capsule_error,
                    );
                StreamEvent::Error(error)
            },
            other => {
                debug!(invocation, sense = other, "Dropping unknown stream event");
                return;
            },
        };

        let terminal = !matches!(event, StreamEvent::Item(_));
        let delivered = self
            .streams
            .get(&invocation)
            .is_some_and(|route| route.send(event).is_ok());
        if !delivered {
            trace!(invocation, "Stream event for a closed route");
        }
        if terminal {
            self.streams.remove(&invocation);
        }
    }

    fn report(&self, error: ProtocolError) {
        warn!(error = %error, "Protocol error on inbound line");
        let _ = self.diagnostics.send(error);
    }

    /// Fail everything outstanding. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        debug!(pending = pending.len(), streams = self.streams.len(), "Connection closed");
        for id in pending {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(CapsuleError::ConnectionClosed));
            }
        }
        let streams: Vec<u64> = self.streams.iter().map(|e| *e.key()).collect();
        for id in streams {
            if let Some((_, route)) = self.streams.remove(&id) {
                let _ = route.send(StreamEvent::Error(CapsuleError::ConnectionClosed));
            }
        }
    }
}

/// Drives one JSONL connection to a capsule host.
///
/// A reader task parses inbound lines and a writer task serializes
/// outbound ones. Requests are registered as pending before their line is
/// queued, so a response can never outrun its registration.
pub struct ProtocolHandler {
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ProtocolHandler {
    /// Start the reader and writer tasks. Must be called inside a Tokio
    /// runtime.
    pub fn new<R, W>(reader: R, writer: W, max_line_bytes: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (diagnostics, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            streams: DashMap::new(),
            listeners: ListenerRegistry::new(),
            diagnostics,
            outbound,
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(reader_loop(
            Arc::clone(&inner),
            LineReader::new(BufReader::new(reader), max_line_bytes),
        ));
        let writer = tokio::spawn(writer_loop(
            Arc::clone(&inner),
            LineWriter::new(writer),
            outbound_rx,
        ));

        Self {
            inner,
            reader,
            writer,
        }
    }

    /// Allocate a request id.
    #[must_use]
    pub fn next_request_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a stream route under `id`. Do this before sending the
    /// request that opens the stream.
    #[must_use]
    pub fn open_stream(&self, id: u64) -> StreamRoute {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.streams.insert(id, tx);
        if self.inner.closed.load(Ordering::SeqCst)
            && let Some((_, tx)) = self.inner.streams.remove(&id)
        {
            let _ = tx.send(StreamEvent::Error(CapsuleError::ConnectionClosed));
        }
        StreamRoute {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Register request `id` as pending, then queue its line.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::ConnectionClosed`] if the connection is gone.
    pub fn send(&self, id: u64, method: &str, params: Value) -> CapsuleResult<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let pending = PendingResponse {
            id,
            rx,
            inner: Arc::clone(&self.inner),
            detached: false,
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CapsuleError::ConnectionClosed);
        }

        let line = WireMessage::Request(Request {
            id,
            method: method.to_owned(),
            params,
        })
        .to_line();
        trace!(request_id = id, method, "Sending request");
        self.inner
            .outbound
            .send(line)
            .map_err(|_| CapsuleError::ConnectionClosed)?;
        Ok(pending)
    }

    /// Send a request and wait for its response, failing after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the remote error, [`CapsuleError::Timeout`], or
    /// [`CapsuleError::ConnectionClosed`].
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> CapsuleResult<Value> {
        let pending = self.send(self.next_request_id(), method, params)?;
        tokio::time::timeout(timeout, pending.wait())
            .await
            .map_err(|_| CapsuleError::Timeout {
                method: method.to_owned(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Listeners for ambient stimuli. Stream events are never delivered here.
    #[must_use]
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Subscribe to protocol errors found on inbound lines.
    #[must_use]
    pub fn diagnostics(&self) -> broadcast::Receiver<ProtocolError> {
        self.inner.diagnostics.subscribe()
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Process one inbound line as if the reader task had read it.
    pub fn handle_line(&self, line: &str) {
        self.inner.handle_line(line);
    }
}

impl Drop for ProtocolHandler {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.inner.close();
    }
}

impl fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("pending", &self.inner.pending.len())
            .field("streams", &self.inner.streams.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn reader_loop<R>(inner: Arc<Inner>, mut reader: LineReader<BufReader<R>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next_frame().await {
            Ok(Some(Frame::Line(line))) => inner.handle_line(&line),
            Ok(Some(Frame::Malformed(e))) => inner.report(e),
            Ok(None) => {
                debug!("Capsule connection reached EOF");
                break;
            },
            Err(e) => {
                warn!(error = %e, "Capsule connection read failed");
                break;
            },
        }
    }
    inner.close();
}

async fn writer_loop<W>(
    inner: Arc<Inner>,
    mut writer: LineWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outbound.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            warn!(error = %e, "Capsule connection write failed");
            inner.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// A request awaiting its response.
///
/// Dropping it forgets the request, so a late response is reported as
/// unmatched. [`detach`](Self::detach) keeps the registration instead.
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<CapsuleResult<Value>>,
    inner: Arc<Inner>,
    detached: bool,
}

impl PendingResponse {
    /// The request id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or [`CapsuleError::ConnectionClosed`].
    pub async fn wait(mut self) -> CapsuleResult<Value> {
        (&mut self.rx)
            .await
            .unwrap_or(Err(CapsuleError::ConnectionClosed))
    }

    /// Stop waiting but let the response be consumed silently when it
    /// arrives.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.detached {
            self.inner.pending.remove(&self.id);
        }
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Receiving end of a stream registered with
/// [`ProtocolHandler::open_stream`]. Dropping it removes the route.
pub struct StreamRoute {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    inner: Arc<Inner>,
}

impl StreamRoute {
    /// The invocation id events are routed by.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The next event. `None` once the route has been removed and drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Drop for StreamRoute {
    fn drop(&mut self) {
        self.inner.streams.remove(&self.id);
    }
}

impl fmt::Debug for StreamRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRoute")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
