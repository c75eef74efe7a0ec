//! Byte-stream channels a [`RemoteInstance`](crate::RemoteInstance) can
//! speak the protocol over.

use std::ffi::OsString;
use std::fmt;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info};
use warden_core::{CapsuleError, CapsuleResult};

/// Boxed read half of a transport.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
/// Boxed write half of a transport.
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A duplex byte channel to a process hosting a capsule.
///
/// How the channel is authenticated or established is the transport's
/// business; the protocol only needs the two halves.
#[async_trait]
pub trait Transport: Send {
    /// Open the channel. Called once per connection.
    async fn open(&mut self) -> CapsuleResult<(BoxReader, BoxWriter)>;
}

/// A transport over halves that are already connected, such as an
/// authenticated SSH channel or an in-memory duplex.
pub struct StreamTransport {
    halves: Option<(BoxReader, BoxWriter)>,
}

impl StreamTransport {
    /// Wrap a connected reader and writer.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            halves: Some((Box::pin(reader), Box::pin(writer))),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn open(&mut self) -> CapsuleResult<(BoxReader, BoxWriter)> {
        self.halves
            .take()
            .ok_or_else(|| CapsuleError::Transport("stream transport already opened".into()))
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("opened", &self.halves.is_none())
            .finish()
    }
}

/// Spawns a capsule host process and speaks over its stdin/stdout.
///
/// The child's stderr is inherited so host logs stay visible. The child is
/// killed when the transport is dropped.
#[derive(Debug)]
pub struct CommandTransport {
    program: OsString,
    args: Vec<OsString>,
    child: Option<Child>,
}

impl CommandTransport {
    /// Run `program` with no arguments.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            child: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run `remote_command` on `host` over an `ssh -T` exec channel.
    ///
    /// Authentication is left to the user's SSH configuration.
    pub fn ssh(host: impl Into<OsString>, remote_command: impl Into<OsString>) -> Self {
        Self::new("ssh")
            .arg("-T")
            .arg(host)
            .arg("--")
            .arg(remote_command)
    }

    /// OS process id of the running child, if spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl Transport for CommandTransport {
    async fn open(&mut self) -> CapsuleResult<(BoxReader, BoxWriter)> {
        if self.child.is_some() {
            return Err(CapsuleError::Transport("command already spawned".into()));
        }

        debug!(program = ?self.program, args = ?self.args, "Spawning capsule host");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CapsuleError::Transport(format!(
                    "failed to spawn {}: {e}",
                    self.program.to_string_lossy()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CapsuleError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapsuleError::Transport("child stdout unavailable".into()))?;

        info!(pid = ?child.id(), program = ?self.program, "Capsule host spawned");
        self.child = Some(child);
        Ok((Box::pin(stdout), Box::pin(stdin)))
    }
}
