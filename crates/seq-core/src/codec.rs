//! Wire adapter contract.
//!
//! Device-specific byte formats live in thin adapters implementing [`Codec`].
//! An adapter must frame deterministically (fixed length or terminator) so the
//! channel never has to guess where a response ends.
//!
//! Most devices on the instrument speak line-oriented ASCII; the helpers at
//! the bottom of this module cover the shared parts of those grammars:
//! `!<code>` error replies, `OK` acknowledgements and numeric values.

use crate::channel::ResponseMatcher;
use crate::error::ProtocolError;
use bytes::Bytes;
use std::fmt::Debug;
use std::str::FromStr;

/// Encoder/decoder for one device protocol.
pub trait Codec: Send + Sync + 'static {
    /// Domain-level request (one channel transaction).
    type Request: Debug + Send + Sync;
    /// Decoded reply.
    type Reply: Debug + Send;

    /// Operation name used in logs and errors.
    fn operation(&self, request: &Self::Request) -> &'static str;

    /// Encode a request into the bytes written to the link.
    fn encode(&self, request: &Self::Request) -> Bytes;

    /// Response framing expected for `request`.
    fn response(&self, _request: &Self::Request) -> ResponseMatcher {
        ResponseMatcher::line()
    }

    /// Decode a complete frame.
    fn decode(&self, request: &Self::Request, frame: &[u8]) -> Result<Self::Reply, ProtocolError>;
}

// =============================================================================
// ASCII helpers
// =============================================================================

/// Strip the terminator and validate ASCII. Maps `!<code>` to `DeviceReported`.
pub fn ascii_line(frame: &[u8]) -> Result<&str, ProtocolError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| ProtocolError::Malformed(format!("non-ASCII frame {:?}", frame)))?;
    if !text.is_ascii() {
        return Err(ProtocolError::Malformed(format!("non-ASCII frame {:?}", text)));
    }
    let line = text.trim_end_matches(['\r', '\n']).trim();
    if let Some(code) = line.strip_prefix('!') {
        let code = code
            .trim()
            .parse::<u16>()
            .map_err(|_| ProtocolError::Malformed(format!("bad error reply {:?}", line)))?;
        return Err(ProtocolError::DeviceReported { code });
    }
    Ok(line)
}

/// Expect an exact acknowledgement line.
pub fn expect_line(frame: &[u8], expected: &str) -> Result<(), ProtocolError> {
    let line = ascii_line(frame)?;
    if line == expected {
        Ok(())
    } else {
        Err(ProtocolError::Unexpected {
            expected: expected.to_string(),
            got: line.to_string(),
        })
    }
}

/// Expect `OK`.
pub fn expect_ok(frame: &[u8]) -> Result<(), ProtocolError> {
    expect_line(frame, "OK")
}

/// Parse a value following `prefix` (`"*"`, `"POS "`, ...).
pub fn parse_prefixed<T: FromStr>(frame: &[u8], prefix: &str) -> Result<T, ProtocolError> {
    let line = ascii_line(frame)?;
    let value = line.strip_prefix(prefix).ok_or_else(|| ProtocolError::Unexpected {
        expected: format!("{}<value>", prefix),
        got: line.to_string(),
    })?;
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ProtocolError::Malformed(format!("cannot parse value in {:?}", line)))
}

/// Split `KEY=VALUE` tokens of a status line.
pub fn key_values(line: &str) -> impl Iterator<Item = (&str, &str)> {
    line.split_whitespace()
        .filter_map(|token| token.split_once('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_replies_become_device_codes() {
        assert_eq!(
            ascii_line(b"!07\n"),
            Err(ProtocolError::DeviceReported { code: 7 })
        );
        assert!(matches!(ascii_line(b"!xx\n"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn ok_and_unexpected() {
        assert!(expect_ok(b"OK\r\n").is_ok());
        assert!(matches!(
            expect_ok(b"NO\n"),
            Err(ProtocolError::Unexpected { .. })
        ));
    }

    #[test]
    fn prefixed_values_parse() {
        let pos: i64 = parse_prefixed(b"*-1250\n", "*").unwrap();
        assert_eq!(pos, -1250);
        assert!(parse_prefixed::<i64>(b"*abc\n", "*").is_err());
        assert!(parse_prefixed::<i64>(b"12\n", "*").is_err());
    }

    #[test]
    fn key_value_tokens() {
        let pairs: Vec<_> = key_values("SHUTTER=1 LED=0 junk TRIG=1").collect();
        assert_eq!(pairs, vec![("SHUTTER", "1"), ("LED", "0"), ("TRIG", "1")]);
    }

    #[test]
    fn non_ascii_is_malformed() {
        assert!(matches!(
            ascii_line(&[0xff, 0xfe, b'\n']),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
