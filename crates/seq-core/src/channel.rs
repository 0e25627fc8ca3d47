//! Serial Command Channel.
//!
//! One channel per physical link. A channel runs exactly one transaction at a
//! time: the port is locked for the whole write/read cycle and released on
//! every exit path, including timeouts and a dropped (cancelled) future.
//! Devices are half-duplex, so commands are never pipelined; waiters are served
//! in submission order by the FIFO `tokio::sync::Mutex`.
//!
//! ```text
//! send(cmd) ── lock port ──▶ [drain leftovers if last frame was unclean]
//!                            write + flush
//!                            read until matcher satisfied  (timeout)
//!           ◀── unlock ───── Ok(frame) | Timeout | Malformed | Disconnected
//! ```
//!
//! A frame that ended badly (timeout with partial bytes, oversize frame, or a
//! future dropped mid-read) marks the channel dirty; the next transaction drains
//! the port first so stale bytes are never concatenated with a new response.
//! A disconnect is sticky: every later transaction fails with
//! `Disconnected` without touching the port.

use crate::error::TransactionError;
use crate::serial::{drain_serial_buffer, DynSerial};
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maximum accepted response frame (1 MiB excluding camera readouts).
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Outcome of one channel transaction.
pub type TransactionResult = Result<Bytes, TransactionError>;

// =============================================================================
// Command
// =============================================================================

/// How the end of a response frame is recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatcher {
    /// Exactly `n` bytes.
    FixedLength(usize),
    /// Everything up to and including the terminator sequence.
    Terminator(Bytes),
}

impl ResponseMatcher {
    /// Line-oriented response terminated by `\n`.
    pub fn line() -> Self {
        Self::Terminator(Bytes::from_static(b"\n"))
    }
}

/// An encoded request, immutable once built and consumed by one transaction.
#[derive(Debug, Clone)]
pub struct Command {
    operation: &'static str,
    payload: Bytes,
    matcher: ResponseMatcher,
    timeout: Duration,
}

impl Command {
    pub fn new(
        operation: &'static str,
        payload: impl Into<Bytes>,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Self {
        Self {
            operation,
            payload: payload.into(),
            matcher,
            timeout,
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn matcher(&self) -> &ResponseMatcher {
        &self.matcher
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// =============================================================================
// Channel
// =============================================================================

struct LinkState {
    port: DynSerial,
    dirty: bool,
    disconnected: Option<String>,
}

/// Half-duplex command/response channel over one serial link.
pub struct SerialChannel {
    name: String,
    link: Mutex<LinkState>,
    drain_window: Duration,
    max_response_bytes: usize,
}

enum FrameError {
    Disconnected(String),
    Malformed(String),
}

impl SerialChannel {
    /// Wrap an opened port.
    pub fn new(name: impl Into<String>, port: DynSerial, drain_window: Duration) -> Self {
        Self {
            name: name.into(),
            link: Mutex::new(LinkState {
                port,
                dirty: false,
                disconnected: None,
            }),
            drain_window,
            max_response_bytes: MAX_RESPONSE_BYTES,
        }
    }

    /// Raise the frame size limit (camera readout channels).
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one transaction: write `command`, then wait for a matching frame.
    pub async fn send(&self, command: Command) -> TransactionResult {
        let mut link = self.link.lock().await;

        if let Some(reason) = &link.disconnected {
            return Err(TransactionError::Disconnected(reason.clone()));
        }

        if link.dirty {
            let discarded = drain_serial_buffer(&mut link.port, self.drain_window).await;
            if discarded > 0 {
                warn!(
                    channel = %self.name,
                    discarded,
                    "discarded stale bytes before {}",
                    command.operation
                );
            }
        }
        // Stays set unless the frame completes cleanly (covers a dropped future).
        link.dirty = true;

        if let Err(e) = write_command(&mut link.port, &command.payload).await {
            let reason = e.to_string();
            link.disconnected = Some(reason.clone());
            warn!(channel = %self.name, error = %reason, "write failed, link lost");
            return Err(TransactionError::Disconnected(reason));
        }

        let mut frame = BytesMut::new();
        let read = tokio::time::timeout(
            command.timeout,
            read_frame(
                &mut link.port,
                &command.matcher,
                self.max_response_bytes,
                &mut frame,
            ),
        )
        .await;

        let result = match read {
            Ok(Ok(())) => {
                link.dirty = false;
                Ok(frame.freeze())
            }
            Ok(Err(FrameError::Disconnected(reason))) => {
                link.disconnected = Some(reason.clone());
                Err(TransactionError::Disconnected(reason))
            }
            Ok(Err(FrameError::Malformed(reason))) => Err(TransactionError::Malformed(reason)),
            Err(_) if frame.is_empty() => Err(TransactionError::Timeout(command.timeout)),
            Err(_) => Err(TransactionError::Malformed(format!(
                "partial frame of {} byte(s) after {:?}",
                frame.len(),
                command.timeout
            ))),
        };

        match &result {
            Ok(frame) => debug!(
                channel = %self.name,
                op = command.operation,
                tx = ?command.payload,
                rx = ?truncate(frame),
                "transaction ok"
            ),
            Err(err) => debug!(
                channel = %self.name,
                op = command.operation,
                tx = ?command.payload,
                error = %err,
                "transaction failed"
            ),
        }

        result
    }
}

async fn write_command(port: &mut DynSerial, payload: &[u8]) -> io::Result<()> {
    port.write_all(payload).await?;
    port.flush().await
}

/// Read exactly one frame into `frame`. Never reads past the frame boundary.
async fn read_frame(
    port: &mut DynSerial,
    matcher: &ResponseMatcher,
    max_bytes: usize,
    frame: &mut BytesMut,
) -> Result<(), FrameError> {
    match matcher {
        ResponseMatcher::FixedLength(len) => {
            if *len > max_bytes {
                return Err(FrameError::Malformed(format!(
                    "frame of {} bytes exceeds limit {}",
                    len, max_bytes
                )));
            }
            let mut chunk = vec![0u8; (*len).min(8192)];
            while frame.len() < *len {
                let want = (*len - frame.len()).min(chunk.len());
                let n = read_some(port, &mut chunk[..want]).await?;
                frame.extend_from_slice(&chunk[..n]);
            }
            Ok(())
        }
        ResponseMatcher::Terminator(term) => {
            let mut byte = [0u8; 1];
            loop {
                read_some(port, &mut byte).await?;
                frame.extend_from_slice(&byte);
                if frame.ends_with(term) {
                    return Ok(());
                }
                if frame.len() > max_bytes {
                    return Err(FrameError::Malformed(format!(
                        "no terminator within {} bytes",
                        max_bytes
                    )));
                }
            }
        }
    }
}

async fn read_some(port: &mut DynSerial, buf: &mut [u8]) -> Result<usize, FrameError> {
    match port.read(buf).await {
        Ok(0) => Err(FrameError::Disconnected("end of stream".into())),
        Ok(n) => Ok(n),
        Err(e) => match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::Interrupted => {
                Err(FrameError::Malformed(e.to_string()))
            }
            _ => Err(FrameError::Disconnected(e.to_string())),
        },
    }
}

fn truncate(frame: &Bytes) -> Bytes {
    if frame.len() > 64 {
        frame.slice(..64)
    } else {
        frame.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn line_cmd(text: &'static str) -> Command {
        Command::new(
            "test",
            Bytes::from_static(text.as_bytes()),
            ResponseMatcher::line(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn terminator_frame_is_returned_whole() {
        let (host, device) = tokio::io::duplex(256);
        let channel = SerialChannel::new("t", Box::new(device), Duration::from_millis(5));

        let responder = tokio::spawn(async move {
            let mut host = BufReader::new(host);
            let mut line = String::new();
            host.read_line(&mut line).await.unwrap();
            assert_eq!(line, "PING\n");
            host.get_mut().write_all(b"PONG\n").await.unwrap();
            host
        });

        let frame = channel.send(line_cmd("PING\n")).await.unwrap();
        assert_eq!(&frame[..], b"PONG\n");
        drop(responder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_a_timeout() {
        let (_host, device) = tokio::io::duplex(256);
        let channel = SerialChannel::new("t", Box::new(device), Duration::from_millis(5));

        let err = channel.send(line_cmd("PING\n")).await.unwrap_err();
        assert_eq!(err, TransactionError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_frame_is_malformed_and_not_carried_over() {
        let (mut host, device) = tokio::io::duplex(256);
        let channel = SerialChannel::new("t", Box::new(device), Duration::from_millis(5));

        // Half a line, no terminator.
        host.write_all(b"PAR").await.unwrap();
        let err = channel.send(line_cmd("A\n")).await.unwrap_err();
        assert!(matches!(err, TransactionError::Malformed(_)));

        // Late tail of the old frame, then the real answer after the drain window.
        host.write_all(b"TIAL\n").await.unwrap();
        let host_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            host.write_all(b"OK\n").await.unwrap();
            host
        });
        let frame = channel.send(line_cmd("B\n")).await.unwrap();
        assert_eq!(&frame[..], b"OK\n");
        drop(host_task.await.unwrap());
    }

    #[tokio::test]
    async fn fixed_length_frame_reads_exact_bytes() {
        let (mut host, device) = tokio::io::duplex(256);
        let channel = SerialChannel::new("t", Box::new(device), Duration::from_millis(5));
        host.write_all(&[1, 2, 3, 4]).await.unwrap();

        let cmd = Command::new(
            "read",
            Bytes::from_static(b"R\n"),
            ResponseMatcher::FixedLength(4),
            Duration::from_millis(100),
        );
        let frame = channel.send(cmd).await.unwrap();
        assert_eq!(&frame[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn eof_is_a_sticky_disconnect() {
        let (host, device) = tokio::io::duplex(256);
        let channel = SerialChannel::new("t", Box::new(device), Duration::from_millis(5));
        drop(host);

        let err = channel.send(line_cmd("A\n")).await.unwrap_err();
        assert!(matches!(err, TransactionError::Disconnected(_)));

        let err = channel.send(line_cmd("B\n")).await.unwrap_err();
        assert!(matches!(err, TransactionError::Disconnected(_)));
    }
}
