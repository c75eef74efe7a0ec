//! Newline framing over async byte streams.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// One unit produced by a [`LineReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete, non-blank line without its terminator.
    Line(String),
    /// A line that could not be delivered. Framing is intact afterwards.
    Malformed(ProtocolError),
}

/// Splits an inbound byte stream into lines.
///
/// Blank and whitespace-only lines are skipped and a trailing `\r` is
/// stripped. A line longer than the limit is reported once and the rest of
/// it is discarded up to the next newline, so one bad line never corrupts
/// the framing of the lines after it.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    line: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            line: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Read the next frame. `None` means end of stream.
    ///
    /// Cancel safe: a partially read line is kept and completed by the next
    /// call.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let available = self.reader.fill_buf().await?;

            if available.is_empty() {
                if self.discarding {
                    self.discarding = false;
                    self.line.clear();
                }
                if self.line.is_empty() {
                    return Ok(None);
                }
                let raw = std::mem::take(&mut self.line);
                if let Some(frame) = finish_line(raw) {
                    return Ok(Some(frame));
                }
                continue;
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let (chunk, consumed) = match newline {
                Some(pos) => (&available[..pos], pos.saturating_add(1)),
                None => (available, available.len()),
            };
            if !self.discarding {
                self.line.extend_from_slice(chunk);
            }
            self.reader.consume(consumed);

            if !self.discarding && self.line.len() > self.max_line_bytes {
                self.line.clear();
                self.discarding = newline.is_none();
                return Ok(Some(Frame::Malformed(ProtocolError::LineTooLong {
                    limit: self.max_line_bytes,
                })));
            }

            if newline.is_some() {
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                let raw = std::mem::take(&mut self.line);
                if let Some(frame) = finish_line(raw) {
                    return Ok(Some(frame));
                }
            }
        }
    }
}

fn finish_line(mut raw: Vec<u8>) -> Option<Frame> {
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    if raw.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(match String::from_utf8(raw) {
        Ok(line) => Frame::Line(line),
        Err(_) => Frame::Malformed(ProtocolError::InvalidUtf8),
    })
}

/// Writes newline-terminated lines and flushes after each one.
#[derive(Debug)]
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write `line` followed by `\n`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Shut the write half down.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
