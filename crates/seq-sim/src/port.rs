//! Simulated serial port.
//!
//! A [`SimPort`] looks like any other serial link to the engine (it is an
//! `AsyncRead + AsyncWrite` stream). Every `\r`-terminated command written to
//! it is recorded in a transcript and answered synchronously by a
//! [`SimDevice`]. A [`PortHandle`] kept by the test can inject faults and
//! inspect the transcript while the port is owned by a driver.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Command terminator accepted by every simulated device.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// What a simulated device answers to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// An ASCII line; `\n` is appended.
    Line(String),
    /// Raw bytes, written as-is (binary readouts).
    Raw(Vec<u8>),
    /// No answer at all.
    Silent,
}

impl SimReply {
    pub fn ok() -> Self {
        SimReply::Line("OK".into())
    }

    pub fn error(code: u16) -> Self {
        SimReply::Line(format!("!{}", code))
    }

    pub fn value(value: impl std::fmt::Display) -> Self {
        SimReply::Line(format!("*{}", value))
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            SimReply::Line(mut line) => {
                line.push('\n');
                line.into_bytes()
            }
            SimReply::Raw(bytes) => bytes,
            SimReply::Silent => Vec::new(),
        }
    }
}

/// Behaviour behind a simulated port.
pub trait SimDevice: Send + 'static {
    fn respond(&mut self, command: &str) -> SimReply;
}

/// Transport-level fault applied to a matching command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Command is lost; the device never answers.
    Silence,
    /// Device answers with bytes that are not a valid frame.
    Garble,
    /// Device rejects the command with an error code.
    DeviceError(u16),
    /// Device answers normally, but only after the delay.
    Delay(Duration),
    /// Link drops while the command is in flight.
    Disconnect,
}

#[derive(Debug)]
struct FaultRule {
    prefix: String,
    fault: Fault,
    /// `None` applies forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Shared {
    transcript: Vec<String>,
    rules: Vec<FaultRule>,
    disconnected: bool,
    read_waker: Option<Waker>,
}

impl Shared {
    fn take_fault(&mut self, command: &str) -> Option<Fault> {
        let rule = self.rules.iter_mut().find(|rule| {
            command.starts_with(&rule.prefix) && rule.remaining.map_or(true, |n| n > 0)
        })?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.fault.clone())
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

/// Test-side view of a [`SimPort`].
#[derive(Debug, Clone)]
pub struct PortHandle {
    name: Arc<str>,
    shared: Arc<Mutex<Shared>>,
}

impl PortHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every command received so far, without terminators.
    pub fn transcript(&self) -> Vec<String> {
        self.shared.lock().transcript.clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.shared
            .lock()
            .transcript
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_transcript(&self) {
        self.shared.lock().transcript.clear();
    }

    /// Apply `fault` to the next command starting with `prefix`.
    pub fn inject(&self, prefix: &str, fault: Fault) {
        self.inject_times(prefix, fault, 1);
    }

    /// Apply `fault` to the next `times` commands starting with `prefix`.
    pub fn inject_times(&self, prefix: &str, fault: Fault, times: u32) {
        self.push_rule(prefix, fault, Some(times));
    }

    /// Apply `fault` to every command starting with `prefix`.
    pub fn inject_always(&self, prefix: &str, fault: Fault) {
        self.push_rule(prefix, fault, None);
    }

    pub fn clear_faults(&self) {
        self.shared.lock().rules.clear();
    }

    /// Drop the link now, waking a pending reader with end-of-stream.
    pub fn disconnect(&self) {
        let mut shared = self.shared.lock();
        shared.disconnected = true;
        shared.wake_reader();
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.lock().disconnected
    }

    fn push_rule(&self, prefix: &str, fault: Fault, remaining: Option<u32>) {
        self.shared.lock().rules.push(FaultRule {
            prefix: prefix.to_string(),
            fault,
            remaining,
        });
    }
}

/// Simulated serial link to one device.
pub struct SimPort {
    device: Box<dyn SimDevice>,
    shared: Arc<Mutex<Shared>>,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    delayed: Option<(Pin<Box<Sleep>>, Vec<u8>)>,
}

impl SimPort {
    /// Create a port answering with `device`, plus its test handle.
    pub fn new(name: &str, device: impl SimDevice) -> (Self, PortHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let handle = PortHandle {
            name: Arc::from(name),
            shared: shared.clone(),
        };
        let port = Self {
            device: Box::new(device),
            shared,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            delayed: None,
        };
        (port, handle)
    }

    fn handle_command(&mut self, command: String) {
        let fault = {
            let mut shared = self.shared.lock();
            shared.transcript.push(command.clone());
            shared.take_fault(&command)
        };

        let reply = match fault {
            None => self.device.respond(&command).into_bytes(),
            Some(Fault::Silence) => Vec::new(),
            Some(Fault::Garble) => vec![0xFF, 0xFE, b'?', b'\n'],
            Some(Fault::DeviceError(code)) => SimReply::error(code).into_bytes(),
            Some(Fault::Delay(delay)) => {
                let bytes = self.device.respond(&command).into_bytes();
                self.delayed = Some((Box::pin(tokio::time::sleep(delay)), bytes));
                return;
            }
            Some(Fault::Disconnect) => {
                let mut shared = self.shared.lock();
                shared.disconnected = true;
                shared.wake_reader();
                return;
            }
        };

        self.outbound.extend(reply);
        self.shared.lock().wake_reader();
    }
}

impl AsyncWrite for SimPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shared.lock().disconnected {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated link disconnected",
            )));
        }

        this.inbound.extend_from_slice(buf);
        while let Some(end) = this.inbound.iter().position(|b| *b == COMMAND_TERMINATOR) {
            let raw: Vec<u8> = this.inbound.drain(..=end).collect();
            let command = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();
            this.handle_command(command);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for SimPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some((sleep, _)) = this.delayed.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                if let Some((_, bytes)) = this.delayed.take() {
                    this.outbound.extend(bytes);
                }
            }
        }

        if !this.outbound.is_empty() {
            let n = buf.remaining().min(this.outbound.len());
            let chunk: Vec<u8> = this.outbound.drain(..n).collect();
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        let mut shared = this.shared.lock();
        if shared.disconnected {
            // End of stream.
            return Poll::Ready(Ok(()));
        }
        shared.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    impl SimDevice for Echo {
        fn respond(&mut self, command: &str) -> SimReply {
            SimReply::Line(command.to_lowercase())
        }
    }

    #[tokio::test]
    async fn commands_are_answered_and_recorded() {
        let (mut port, handle) = SimPort::new("echo", Echo);
        port.write_all(b"PING\rPONG\r").await.unwrap();

        let mut buf = [0u8; 10];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\npong\n");
        assert_eq!(handle.transcript(), vec!["PING", "PONG"]);
    }

    #[tokio::test]
    async fn injected_error_applies_once() {
        let (mut port, handle) = SimPort::new("echo", Echo);
        handle.inject("A", Fault::DeviceError(9));
        port.write_all(b"A\rA\r").await.unwrap();

        let mut buf = [0u8; 5];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"!9\na\n");
    }

    #[tokio::test]
    async fn disconnect_yields_eof_then_broken_pipe() {
        let (mut port, handle) = SimPort::new("echo", Echo);
        handle.inject("X", Fault::Disconnect);
        port.write_all(b"X\r").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).await.unwrap(), 0);
        assert!(port.write_all(b"Y\r").await.is_err());
        assert!(handle.is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_arrives_after_delay() {
        let (mut port, handle) = SimPort::new("echo", Echo);
        handle.inject("SLOW", Fault::Delay(Duration::from_millis(40)));
        let start = tokio::time::Instant::now();
        port.write_all(b"SLOW\r").await.unwrap();

        let mut buf = [0u8; 5];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"slow\n");
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
