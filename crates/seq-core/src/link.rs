//! Device link: a channel, a codec and the device's recovery policy.
//!
//! [`DeviceLink::request`] is the only way drivers talk to hardware. It turns a
//! domain request into one or more channel transactions and applies the
//! escalation rules:
//!
//! - `Timeout` → retried up to `retry.max_retries` with the configured back-off,
//!   then escalated as [`SeqError::Protocol`]
//! - `Malformed` → retried once, then escalated as [`SeqError::Protocol`]
//! - `DeviceReported(code)` → escalated immediately as [`SeqError::DeviceFault`]
//! - `Disconnected` → escalated immediately as [`SeqError::Transport`]
//!
//! [`DeviceLink::poll_until`] implements bounded post-condition checks.

use crate::channel::{Command, SerialChannel};
use crate::codec::Codec;
use crate::device::DeviceId;
use crate::error::{SeqError, SeqResult, TransactionError};
use crate::retry::{PollPolicy, RetryPolicy};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timeout, retry and polling settings for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
        }
    }
}

/// Typed request/response access to one device.
pub struct DeviceLink<C: Codec> {
    id: DeviceId,
    channel: SerialChannel,
    codec: C,
    settings: LinkSettings,
}

impl<C: Codec> DeviceLink<C> {
    pub fn new(id: DeviceId, channel: SerialChannel, codec: C, settings: LinkSettings) -> Self {
        Self {
            id,
            channel,
            codec,
            settings,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Send `request`, retrying transient failures per policy.
    pub async fn request(&self, request: C::Request) -> SeqResult<C::Reply> {
        let operation = self.codec.operation(&request);
        let retry = self.settings.retry;
        let mut attempts = 0u32;
        let mut timeouts = 0u32;
        let mut malformed = 0u32;

        loop {
            attempts += 1;
            let command = Command::new(
                operation,
                self.codec.encode(&request),
                self.codec.response(&request),
                self.settings.timeout,
            );

            let outcome = match self.channel.send(command).await {
                Ok(frame) => self
                    .codec
                    .decode(&request, &frame)
                    .map_err(TransactionError::from),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(TransactionError::Disconnected(message)) => {
                    return Err(SeqError::Transport {
                        device: self.id.clone(),
                        operation,
                        message,
                    })
                }
                Err(TransactionError::DeviceReported(code)) => {
                    return Err(SeqError::DeviceFault {
                        device: self.id.clone(),
                        operation,
                        code,
                    })
                }
                Err(TransactionError::Timeout(after)) => {
                    if timeouts >= retry.max_retries {
                        return Err(SeqError::Protocol {
                            device: self.id.clone(),
                            operation,
                            attempts,
                            message: format!("no response within {:?}", after),
                        });
                    }
                    timeouts += 1;
                    let delay = retry.backoff.delay(timeouts);
                    warn!(device = %self.id, operation, attempt = attempts, ?delay, "timeout, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(TransactionError::Malformed(message)) => {
                    if malformed >= 1 {
                        return Err(SeqError::Protocol {
                            device: self.id.clone(),
                            operation,
                            attempts,
                            message,
                        });
                    }
                    malformed += 1;
                    warn!(device = %self.id, operation, %message, "malformed response, retrying once");
                }
            }
        }
    }

    /// Probe until `done` accepts the value or the poll budget is exhausted.
    ///
    /// Exhausting the budget is reported as [`SeqError::OperationIncomplete`],
    /// never as a transport or protocol failure.
    pub async fn poll_until<T, F, Fut, P>(
        &self,
        operation: &'static str,
        mut read: F,
        done: P,
    ) -> SeqResult<T>
    where
        T: Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = SeqResult<T>>,
        P: Fn(&T) -> bool,
    {
        let policy = self.settings.poll;
        let mut last = None;

        for poll in 1..=policy.max_polls {
            let value = read().await?;
            if done(&value) {
                return Ok(value);
            }
            last = Some(value);
            if poll < policy.max_polls {
                tokio::time::sleep(policy.interval).await;
            }
        }

        Err(SeqError::OperationIncomplete {
            device: self.id.clone(),
            operation,
            polls: policy.max_polls,
            detail: format!("last reading {:?}", last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ResponseMatcher;
    use crate::codec::{ascii_line, parse_prefixed};
    use crate::device::DeviceKind;
    use crate::error::{ErrorClass, ProtocolError};
    use crate::retry::Backoff;
    use bytes::Bytes;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct EchoCodec;

    impl Codec for EchoCodec {
        type Request = &'static str;
        type Reply = i64;

        fn operation(&self, _request: &Self::Request) -> &'static str {
            "echo"
        }

        fn encode(&self, request: &Self::Request) -> Bytes {
            Bytes::from(format!("{}\n", request))
        }

        fn response(&self, _request: &Self::Request) -> ResponseMatcher {
            ResponseMatcher::line()
        }

        fn decode(&self, _request: &Self::Request, frame: &[u8]) -> Result<i64, ProtocolError> {
            ascii_line(frame)?;
            parse_prefixed(frame, "*")
        }
    }

    fn link(device: DuplexStream, max_retries: u32) -> DeviceLink<EchoCodec> {
        DeviceLink::new(
            DeviceId::new(DeviceKind::Valve, "valve_a"),
            SerialChannel::new("valve_a", Box::new(device), Duration::from_millis(5)),
            EchoCodec,
            LinkSettings {
                timeout: Duration::from_millis(50),
                retry: RetryPolicy {
                    max_retries,
                    backoff: Backoff::Fixed {
                        delay: Duration::from_millis(10),
                    },
                },
                poll: PollPolicy {
                    interval: Duration::from_millis(10),
                    max_polls: 3,
                },
            },
        )
    }

    /// Reply to each received line with the next scripted answer.
    fn script(host: DuplexStream, replies: Vec<&'static [u8]>) -> tokio::task::JoinHandle<usize> {
        tokio::spawn(async move {
            let mut host = BufReader::new(host);
            let mut seen = 0;
            for reply in replies {
                let mut line = String::new();
                if host.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                seen += 1;
                if !reply.is_empty() {
                    host.get_mut().write_all(reply).await.unwrap();
                }
            }
            seen
        })
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_then_escalated() {
        let (host, device) = tokio::io::duplex(256);
        let link = link(device, 2);
        let responder = script(host, vec![b"", b"", b"", b""]);

        let err = link.request("Q").await.unwrap_err();
        match err {
            SeqError::Protocol { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
        drop(link);
        assert_eq!(responder.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_success() {
        let (host, device) = tokio::io::duplex(256);
        let link = link(device, 2);
        let _responder = script(host, vec![b"", b"*42\n"]);

        assert_eq!(link.request("Q").await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_is_retried_exactly_once() {
        let (host, device) = tokio::io::duplex(256);
        let link = link(device, 5);
        let _responder = script(host, vec![b"garbage\n", b"junk\n", b"*1\n"]);

        let err = link.request("Q").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert!(matches!(err, SeqError::Protocol { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_is_not_retried() {
        let (host, device) = tokio::io::duplex(256);
        let link = link(device, 5);
        let _responder = script(host, vec![b"!3\n", b"*1\n"]);

        let err = link.request("Q").await.unwrap_err();
        assert!(matches!(err, SeqError::DeviceFault { code: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_fatal_and_never_retried() {
        let (host, device) = tokio::io::duplex(256);
        let link = link(device, 5);
        drop(host);

        let err = link.request("Q").await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.class(), ErrorClass::Transport);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_budget_exhaustion_is_operation_incomplete() {
        let (host, device) = tokio::io::duplex(256);
        let link = link(device, 0);
        let _responder = script(host, vec![b"*1\n", b"*1\n", b"*1\n"]);

        let err = link
            .poll_until("settle", || link.request("Q"), |v| *v == 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SeqError::OperationIncomplete { polls: 3, .. }));
    }
}
