//! Line-oriented ASCII adapter shared by most instrument firmware.
//!
//! Commands are written as `<command>\r`, replies arrive as `<line>\n`.
//! A device request type describes its own command text and how its reply
//! line parses; [`AsciiCodec`] turns that into a [`Codec`].

use bytes::Bytes;
use seq_core::channel::{ResponseMatcher, SerialChannel};
use seq_core::codec::{ascii_line, Codec};
use seq_core::config::DeviceSettings;
use seq_core::device::DeviceId;
use seq_core::error::{ProtocolError, SeqError};
use seq_core::link::DeviceLink;
use seq_core::serial::DynSerial;
use std::fmt::Debug;
use std::marker::PhantomData;

/// Terminator appended to every command.
pub const COMMAND_TERMINATOR: &str = "\r";

/// A request of an ASCII device protocol.
pub trait AsciiRequest: Debug + Send + Sync + 'static {
    type Reply: Debug + Send;

    /// Operation name used in logs and errors.
    fn operation(&self) -> &'static str;

    /// Command text without terminator.
    fn command(&self) -> String;

    /// Parse the reply line (terminator and `!<code>` errors already handled).
    fn parse(&self, line: &str) -> Result<Self::Reply, ProtocolError>;
}

/// [`Codec`] for any [`AsciiRequest`] type.
pub struct AsciiCodec<R>(PhantomData<fn() -> R>);

impl<R> AsciiCodec<R> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for AsciiCodec<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: AsciiRequest> Codec for AsciiCodec<R> {
    type Request = R;
    type Reply = R::Reply;

    fn operation(&self, request: &R) -> &'static str {
        request.operation()
    }

    fn encode(&self, request: &R) -> Bytes {
        Bytes::from(format!("{}{}", request.command(), COMMAND_TERMINATOR))
    }

    fn response(&self, _request: &R) -> ResponseMatcher {
        ResponseMatcher::line()
    }

    fn decode(&self, request: &R, frame: &[u8]) -> Result<R::Reply, ProtocolError> {
        request.parse(ascii_line(frame)?)
    }
}

/// Build the link a driver talks through.
pub fn ascii_link<R: AsciiRequest>(
    id: DeviceId,
    port: DynSerial,
    settings: &DeviceSettings,
) -> DeviceLink<AsciiCodec<R>> {
    let channel = SerialChannel::new(id.endpoint.clone(), port, settings.drain_window);
    DeviceLink::new(id, channel, AsciiCodec::new(), settings.link())
}

// =============================================================================
// Reply grammar helpers
// =============================================================================

/// Expect `OK`.
pub fn ack(line: &str) -> Result<(), ProtocolError> {
    if line == "OK" {
        Ok(())
    } else {
        Err(ProtocolError::Unexpected {
            expected: "OK".into(),
            got: line.into(),
        })
    }
}

/// Parse `*<value>`.
pub fn value<T: std::str::FromStr>(line: &str) -> Result<T, ProtocolError> {
    let raw = line.strip_prefix('*').ok_or_else(|| ProtocolError::Unexpected {
        expected: "*<value>".into(),
        got: line.into(),
    })?;
    raw.trim()
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("cannot parse value in {:?}", line)))
}

/// Parse `*0` / `*1`.
pub fn flag(line: &str) -> Result<bool, ProtocolError> {
    match value::<u8>(line)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::Malformed(format!("flag out of range: {}", other))),
    }
}

/// Error for a reply that parsed but does not belong to the request.
pub fn unexpected_reply(id: &DeviceId, operation: &'static str, reply: impl Debug) -> SeqError {
    SeqError::Protocol {
        device: id.clone(),
        operation,
        attempts: 1,
        message: format!("unexpected reply {:?}", reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;

    impl AsciiRequest for Ping {
        type Reply = i64;

        fn operation(&self) -> &'static str {
            "ping"
        }

        fn command(&self) -> String {
            "PING?".into()
        }

        fn parse(&self, line: &str) -> Result<i64, ProtocolError> {
            value(line)
        }
    }

    #[test]
    fn codec_appends_terminator_and_parses_values() {
        let codec = AsciiCodec::<Ping>::new();
        assert_eq!(&codec.encode(&Ping)[..], b"PING?\r");
        assert_eq!(codec.decode(&Ping, b"*-12\n").unwrap(), -12);
        assert_eq!(
            codec.decode(&Ping, b"!4\n"),
            Err(ProtocolError::DeviceReported { code: 4 })
        );
    }

    #[test]
    fn grammar_helpers() {
        assert!(ack("OK").is_ok());
        assert!(ack("NO").is_err());
        assert!(flag("*1").unwrap());
        assert!(flag("*7").is_err());
        assert!(value::<f64>("3.5").is_err());
    }
}
