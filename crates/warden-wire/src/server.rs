//! Host-side server: exposes a [`CapsuleCore`] over one JSONL connection.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use warden_capsule::CapsuleCore;
use warden_config::WireConfig;
use warden_core::{
    CancelReason, CancellationToken, CapsuleDefinition, CapsuleError, CapsuleResult,
    LifecycleState, Stimulus, TriggerOutput, ValueStream,
};

use crate::error::WireError;
use crate::framing::{Frame, LineReader, LineWriter};
use crate::message::{
    Request, Response, STREAM_END, STREAM_ERROR, STREAM_ITEM, WireMessage, WireStimulus, method,
};

#[derive(Deserialize)]
struct TriggerParams {
    capability: String,
    operation: String,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
struct CancelParams {
    invocation: u64,
    #[serde(default)]
    reason: Option<String>,
}

/// Serves one capsule to one caller.
///
/// Requests are dispatched concurrently. All output lines go through a
/// single writer task so they never interleave. When the caller hangs up,
/// every in-flight invocation is cancelled with reason `system` and a
/// booted capsule is shut down.
#[derive(Debug)]
pub struct CapsuleServer {
    core: Arc<CapsuleCore>,
    max_line_bytes: usize,
}

/// State shared by the request tasks of one connection.
struct Connection {
    core: Arc<CapsuleCore>,
    invocations: DashMap<u64, CancellationToken>,
    out: mpsc::UnboundedSender<String>,
}

impl Connection {
    fn send(&self, message: WireMessage) {
        if self.out.send(message.to_line()).is_err() {
            debug!("Dropping output line; writer has stopped");
        }
    }

    fn respond(&self, id: u64, outcome: CapsuleResult<Value>) {
        self.send(WireMessage::Response(Response {
            id,
            outcome: outcome.map_err(WireError::from),
        }));
    }
}

impl CapsuleServer {
    /// Serve an existing core.
    #[must_use]
    pub fn new(core: Arc<CapsuleCore>) -> Self {
        Self {
            core,
            max_line_bytes: WireConfig::default().max_line_bytes,
        }
    }

    /// Serve a fresh core built from `definition`.
    #[must_use]
    pub fn from_definition(definition: impl Into<Arc<CapsuleDefinition>>) -> Self {
        Self::new(Arc::new(CapsuleCore::new(definition)))
    }

    /// Override the inbound line limit.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// The served core.
    #[must_use]
    pub fn core(&self) -> &Arc<CapsuleCore> {
        &self.core
    }

    /// Serve until the caller closes its end of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`CapsuleError::Transport`] if reading fails. Shutdown hook
    /// failures during teardown are logged, not returned.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> CapsuleResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = self.core.definition().name().to_owned();
        let (out, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(LineWriter::new(writer), out_rx));

        let forward = out.clone();
        let subscription = self.core.on_stimulus(Arc::new(move |stimulus: &Stimulus| {
            let line = WireMessage::Stimulus(WireStimulus::from(stimulus)).to_line();
            let _ = forward.send(line);
        }));

        let conn = Arc::new(Connection {
            core: Arc::clone(&self.core),
            invocations: DashMap::new(),
            out,
        });
        let mut reader = LineReader::new(BufReader::new(reader), self.max_line_bytes);
        let mut tasks = JoinSet::new();
        info!(capsule = %name, "Serving capsule");

        let read_result = loop {
            tokio::select! {
                frame = reader.next_frame() => match frame {
                    Ok(Some(Frame::Line(line))) => match WireMessage::parse(&line) {
                        Ok(WireMessage::Request(request)) => {
                            let token = (request.method == method::TRIGGER).then(|| {
                                let token = CancellationToken::new();
                                conn.invocations.insert(request.id, token.clone());
                                token
                            });
                            tasks.spawn(dispatch(Arc::clone(&conn), request, token));
                        },
                        Ok(_) => warn!(capsule = %name, "Ignoring non-request message from caller"),
                        Err(e) => warn!(capsule = %name, error = %e, "Malformed request line"),
                    },
                    Ok(Some(Frame::Malformed(e))) => {
                        warn!(capsule = %name, error = %e, "Malformed request line");
                    },
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(CapsuleError::Transport(e.to_string())),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(capsule = %name, error = %e, "Request task failed");
                    }
                },
            }
        };

        debug!(capsule = %name, "Caller disconnected; tearing down");
        let tokens: Vec<CancellationToken> = conn
            .invocations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for token in tokens {
            token.cancel(CancelReason::System);
        }
        if self.core.state() == LifecycleState::Booted
            && let Err(e) = self.core.shutdown().await
        {
            warn!(capsule = %name, error = %e, "Shutdown after disconnect failed");
        }

        subscription.unsubscribe();
        tasks.shutdown().await;
        drop(conn);
        if let Err(e) = writer.await {
            warn!(capsule = %name, error = %e, "Writer task failed");
        }
        info!(capsule = %name, "Connection closed");
        read_result
    }
}

async fn write_lines<W>(mut writer: LineWriter<W>, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            warn!(error = %e, "Write to caller failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn dispatch(conn: Arc<Connection>, request: Request, token: Option<CancellationToken>) {
    let Request {
        id,
        method: name,
        params,
    } = request;
    debug!(request_id = id, method = %name, "Request");

    let outcome = match name.as_str() {
        method::DESCRIBE => serde_json::to_value(conn.core.describe()).map_err(CapsuleError::from),
        method::BOOT => conn.core.boot().await.map(|()| Value::Null),
        method::SHUTDOWN => conn.core.shutdown().await.map(|()| Value::Null),
        method::CANCEL => cancel(&conn, params),
        method::TRIGGER => {
            let token = token.unwrap_or_default();
            trigger(&conn, id, params, token).await;
            conn.invocations.remove(&id);
            return;
        },
        other => Err(CapsuleError::Protocol(format!("unknown method '{other}'"))),
    };
    conn.respond(id, outcome);
}

fn cancel(conn: &Connection, params: Value) -> CapsuleResult<Value> {
    let params: CancelParams = serde_json::from_value(params)
        .map_err(|e| CapsuleError::Protocol(format!("invalid cancel params: {e}")))?;
    let reason = params
        .reason
        .as_deref()
        .and_then(CancelReason::parse)
        .unwrap_or(CancelReason::User);

    let token = conn
        .invocations
        .get(&params.invocation)
        .map(|entry| entry.value().clone());
    let found = token.is_some();
    if let Some(token) = token {
        debug!(invocation = params.invocation, %reason, "Cancelling invocation");
        token.cancel(reason);
    }
    Ok(Value::Bool(found))
}

async fn trigger(conn: &Connection, id: u64, params: Value, token: CancellationToken) {
    let params: TriggerParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            conn.respond(
                id,
                Err(CapsuleError::Protocol(format!("invalid trigger params: {e}"))),
            );
            return;
        },
    };
    let TriggerParams {
        capability,
        operation,
        params,
    } = params;

    match conn
        .core
        .trigger(&capability, &operation, params, Some(token))
        .await
    {
        Ok(TriggerOutput::Value(value)) => conn.respond(id, Ok(value)),
        Ok(TriggerOutput::Stream(stream)) => {
            conn.respond(id, Ok(json!({ "stream": id })));
            drain_stream(conn, id, &capability, &operation, stream).await;
        },
        Err(e) => conn.respond(id, Err(e)),
    }
}

/// Forward stream items as `$stream.*` events scoped to `invocation`.
async fn drain_stream(
    conn: &Connection,
    invocation: u64,
    capability: &str,
    operation: &str,
    mut stream: ValueStream,
) {
    let event = |sense: &str, data: Value| {
        WireMessage::Stimulus(WireStimulus::stream_event(
            sense, data, capability, operation, invocation,
        ))
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => conn.send(event(STREAM_ITEM, value)),
            Err(e) => {
                let error = serde_json::to_value(WireError::from(&e)).unwrap_or(Value::Null);
                conn.send(event(STREAM_ERROR, error));
                return;
            },
        }
    }
    conn.send(event(STREAM_END, Value::Null));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize as _;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, DuplexStream, Lines};
    use warden_core::{Capability, ExecutionContext, Operation};

    #[derive(serde::Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn definition() -> CapsuleDefinition {
        CapsuleDefinition::builder("calc")
            .capability(
                Capability::new("math", "Arithmetic")
                    .operation(Operation::call("add", |ctx: ExecutionContext<Add>| async move {
                        ctx.emit("added", json!(ctx.params.a));
                        Ok(ctx.params.a.wrapping_add(ctx.params.b))
                    }))
                    .operation(Operation::stream("count", |ctx: ExecutionContext<u32>| {
                        futures::stream::iter((0..ctx.params).map(Ok::<_, anyhow::Error>))
                    })),
            )
            .build()
            .unwrap()
    }

    struct Peer {
        lines: Lines<tokio::io::BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        write: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, line: &str) {
            self.write.write_all(line.as_bytes()).await.unwrap();
            self.write.write_all(b"\n").await.unwrap();
        }

        async fn next(&mut self) -> WireMessage {
            let line = self.lines.next_line().await.unwrap().unwrap();
            WireMessage::parse(&line).unwrap()
        }

        async fn response(&mut self) -> Response {
            loop {
                if let WireMessage::Response(response) = self.next().await {
                    return response;
                }
            }
        }
    }

    fn serve() -> (Arc<CapsuleCore>, Peer, tokio::task::JoinHandle<CapsuleResult<()>>) {
        let server = CapsuleServer::from_definition(definition());
        let core = Arc::clone(server.core());
        let (host, caller) = tokio::io::duplex(8192);
        let (read, write) = tokio::io::split(host);
        let handle = tokio::spawn(async move { server.serve(read, write).await });
        let (caller_read, caller_write) = tokio::io::split(caller);
        let peer = Peer {
            lines: tokio::io::BufReader::new(caller_read).lines(),
            write: caller_write,
        };
        (core, peer, handle)
    }

    #[tokio::test]
    async fn test_describe_boot_and_call() {
        let (core, mut peer, _handle) = serve();

        peer.send(r#"{"id":1,"method":"describe"}"#).await;
        let response = peer.response().await;
        assert_eq!(response.id, 1);
        let metadata = response.outcome.unwrap();
        assert_eq!(metadata["name"], json!("calc"));

        peer.send(r#"{"id":2,"method":"boot"}"#).await;
        assert_eq!(peer.response().await.outcome, Ok(Value::Null));
        assert_eq!(core.state(), LifecycleState::Booted);

        peer.send(r#"{"id":3,"method":"trigger","params":{"capability":"math","operation":"add","params":{"a":2,"b":3}}}"#)
            .await;

        let WireMessage::Stimulus(stimulus) = peer.next().await else {
            panic!("expected the handler's stimulus first");
        };
        assert_eq!(stimulus.sense, "added");
        assert_eq!(stimulus.source.unwrap().operation, "add");

        let response = peer.response().await;
        assert_eq!(response.id, 3);
        assert_eq!(response.outcome, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_errors_carry_codes() {
        let (_core, mut peer, _handle) = serve();

        peer.send(r#"{"id":1,"method":"trigger","params":{"capability":"math","operation":"add","params":{}}}"#)
            .await;
        let error = peer.response().await.outcome.unwrap_err();
        assert_eq!(error.code, "illegal_state");

        peer.send(r#"{"id":2,"method":"reboot"}"#).await;
        let error = peer.response().await.outcome.unwrap_err();
        assert_eq!(error.code, "protocol");
    }

    #[tokio::test]
    async fn test_stream_items_are_scoped_events() {
        let (_core, mut peer, _handle) = serve();
        peer.send(r#"{"id":1,"method":"boot"}"#).await;
        peer.response().await;

        peer.send(r#"{"id":2,"method":"trigger","params":{"capability":"math","operation":"count","params":3}}"#)
            .await;
        assert_eq!(peer.response().await.outcome, Ok(json!({"stream": 2})));

        let mut items = Vec::new();
        loop {
            let WireMessage::Stimulus(event) = peer.next().await else {
                panic!("expected stream events");
            };
            assert_eq!(event.stream_invocation(), Some(2));
            match event.sense.as_str() {
                STREAM_ITEM => items.push(u32::deserialize(&event.data).unwrap()),
                STREAM_END => break,
                other => panic!("unexpected event {other}"),
            }
        }
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_the_server() {
        let (_core, mut peer, _handle) = serve();

        peer.send("{oops").await;
        peer.send(r#"{"id":1,"method":"boot"}"#).await;

        assert_eq!(peer.response().await.id, 1);
    }

    #[tokio::test]
    async fn test_disconnect_shuts_the_core_down() {
        let (core, mut peer, handle) = serve();
        peer.send(r#"{"id":1,"method":"boot"}"#).await;
        peer.response().await;

        drop(peer);

        handle.await.unwrap().unwrap();
        assert_eq!(core.state(), LifecycleState::Shutdown);
    }
}
