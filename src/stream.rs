#![allow(dead_code)]

//! Per-execution output plumbing.
//!
//! Each execution gets a pair of sinks (stdout, stderr). A sink tees into a
//! bounded capture buffer and/or a forward destination depending on the
//! command's [`IoMode`]. When the capture buffer overflows, the oldest bytes
//! are dropped and the truncation flag is set on the result. Forwarding to a
//! bounded channel applies back-pressure to the adapter's transport reads.

use std::io::IsTerminal;
use std::sync::Arc;

use bytes::Bytes;
use colored::{Color, Colorize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::command::{IoMode, StreamKind};

/// Default per-stream capture cap: 10 MiB.
pub const DEFAULT_OUTPUT_CAP: usize = 10 * 1024 * 1024;

/// color palette for per-label output prefixes, cycled by name hash
const LABEL_COLORS: &[Color] = &[
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::Green,
];

pub fn label_color(label: &str) -> Color {
    let hash: usize = label.bytes().map(|b| b as usize).sum();
    LABEL_COLORS[hash % LABEL_COLORS.len()]
}

/// A chunk of forwarded output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Bytes,
}

/// Where streamed output goes when the mode forwards it.
#[derive(Clone, Default)]
pub enum ForwardTo {
    /// Line-framed console output with a `[label]` prefix on a TTY.
    #[default]
    Console,
    /// A caller-provided bounded channel; sends await when full.
    Channel(mpsc::Sender<OutputChunk>),
    /// Nowhere (stream mode with no consumer).
    Discard,
}

/// Options for one execution's sinks.
#[derive(Clone)]
pub struct StreamOpts {
    pub mode: IoMode,
    pub cap: usize,
    pub label: String,
    pub forward: ForwardTo,
}

impl StreamOpts {
    pub fn new(mode: IoMode, label: impl Into<String>) -> Self {
        StreamOpts {
            mode,
            cap: DEFAULT_OUTPUT_CAP,
            label: label.into(),
            forward: ForwardTo::Console,
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_forward(mut self, forward: ForwardTo) -> Self {
        self.forward = forward;
        self
    }
}

struct SinkState {
    captured: Vec<u8>,
    dropped: bool,
    /// partial line held back for console framing
    line: Vec<u8>,
}

struct SinkInner {
    kind: StreamKind,
    mode: IoMode,
    cap: usize,
    label: String,
    color: Color,
    tty: bool,
    forward: ForwardTo,
    state: Mutex<SinkState>,
}

/// One writable endpoint (stdout or stderr) for an execution.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<SinkInner>,
    closed: CancellationToken,
}

impl OutputSink {
    fn new(kind: StreamKind, opts: &StreamOpts, closed: CancellationToken) -> Self {
        let tty = match kind {
            StreamKind::Stdout => std::io::stdout().is_terminal(),
            StreamKind::Stderr => std::io::stderr().is_terminal(),
        };
        OutputSink {
            inner: Arc::new(SinkInner {
                kind,
                mode: opts.mode,
                cap: opts.cap,
                label: opts.label.clone(),
                color: label_color(&opts.label),
                tty,
                forward: opts.forward.clone(),
                state: Mutex::new(SinkState {
                    captured: Vec::new(),
                    dropped: false,
                    line: Vec::new(),
                }),
            }),
            closed,
        }
    }

    /// Write one chunk of transport output. Awaits the forward channel when
    /// it is full, which is what propagates back-pressure to the remote.
    pub async fn write(&self, data: &[u8]) {
        if data.is_empty() || self.inner.mode == IoMode::Discard {
            return;
        }

        if self.inner.mode.captures() {
            let mut state = self.inner.state.lock().await;
            state.captured.extend_from_slice(data);
            if state.captured.len() > self.inner.cap {
                let excess = state.captured.len() - self.inner.cap;
                let _ = state.captured.drain(..excess);
                state.dropped = true;
            }
        }

        if self.inner.mode.streams() {
            match &self.inner.forward {
                ForwardTo::Console => self.print_lines(data, false).await,
                ForwardTo::Channel(tx) => {
                    let chunk = OutputChunk {
                        stream: self.inner.kind,
                        data: Bytes::copy_from_slice(data),
                    };
                    if tx.send(chunk).await.is_err() {
                        // consumer went away; treat as a closed sink
                        self.closed.cancel();
                    }
                }
                ForwardTo::Discard => {}
            }
        }
    }

    async fn print_lines(&self, data: &[u8], flush: bool) {
        let mut state = self.inner.state.lock().await;
        state.line.extend_from_slice(data);
        let mut start = 0;
        while let Some(nl) = state.line[start..].iter().position(|&b| b == b'\n') {
            let end = start + nl;
            let line = String::from_utf8_lossy(&state.line[start..end]).into_owned();
            self.emit(&line);
            start = end + 1;
        }
        let _ = state.line.drain(..start);
        if flush && !state.line.is_empty() {
            let line = String::from_utf8_lossy(&state.line).into_owned();
            self.emit(&line);
            state.line.clear();
        }
    }

    fn emit(&self, line: &str) {
        let prefixed = if self.inner.tty && !self.inner.label.is_empty() {
            format!(
                "  {} {}",
                format!("[{}]", self.inner.label).color(self.inner.color),
                line
            )
        } else {
            line.to_string()
        };
        match self.inner.kind {
            StreamKind::Stdout => println!("{prefixed}"),
            StreamKind::Stderr => eprintln!("{prefixed}"),
        }
    }

    /// Read `reader` to EOF, writing every chunk through the sink. Returns
    /// the total byte count. Stops early when the sink is closed.
    pub async fn pump<R>(&self, mut reader: R) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                n = reader.read(&mut buf) => n?,
                _ = self.closed.cancelled() => break,
            };
            if n == 0 {
                break;
            }
            total += n as u64;
            self.write(&buf[..n]).await;
        }
        if self.inner.mode.streams() && matches!(self.inner.forward, ForwardTo::Console) {
            self.print_lines(&[], true).await;
        }
        Ok(total)
    }

    /// Snapshot of the capture buffer without consuming it (used by
    /// adapters that need to classify a failure from stderr content).
    pub async fn peek_captured(&self) -> Bytes {
        let state = self.inner.state.lock().await;
        Bytes::copy_from_slice(&state.captured)
    }

    async fn take_captured(&self) -> (Bytes, bool) {
        let mut state = self.inner.state.lock().await;
        let dropped = state.dropped;
        (Bytes::from(std::mem::take(&mut state.captured)), dropped)
    }
}

/// Captured output of a finished execution.
#[derive(Debug, Default)]
pub struct Captured {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub truncated: bool,
}

/// The pair of sinks for one execution plus its close signal.
pub struct SinkSet {
    pub stdout: OutputSink,
    pub stderr: OutputSink,
    closed: CancellationToken,
}

impl SinkSet {
    /// Build sinks as a child of the execution's cancellation context, so
    /// closing a sink and cancelling the command are the same signal to the
    /// adapter.
    pub fn new(opts: &StreamOpts, ctx: &CancellationToken) -> Self {
        let closed = ctx.child_token();
        SinkSet {
            stdout: OutputSink::new(StreamKind::Stdout, opts, closed.clone()),
            stderr: OutputSink::new(StreamKind::Stderr, opts, closed.clone()),
            closed,
        }
    }

    /// Closing the sinks tells the adapter to terminate the remote process
    /// and release transport resources.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub async fn finish(self) -> Captured {
        let (stdout, out_dropped) = self.stdout.take_captured().await;
        let (stderr, err_dropped) = self.stderr.take_captured().await;
        Captured {
            stdout,
            stderr,
            truncated: out_dropped || err_dropped,
        }
    }
}
