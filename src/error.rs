//! Error types for the IRC client engine.
//!
//! The taxonomy follows the connection lifecycle: transport faults terminate
//! a connection, framing faults poison the receive buffer until reset,
//! message-level faults are reported and skipped.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Top-level protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Received bytes were not valid UTF-8.
    #[error("decode error: {0}")]
    Decode(#[from] std::str::Utf8Error),

    /// An unterminated line filled the receive buffer to its limit.
    ///
    /// The buffer is considered corrupt until [`LineBuffer::reset`] is
    /// called; the connection itself stays open.
    ///
    /// [`LineBuffer::reset`]: crate::line::LineBuffer::reset
    #[error("message too long: {0} bytes without a line terminator")]
    MessageTooLong(usize),

    /// Failed to parse an IRC message.
    #[error("invalid message: {string}")]
    InvalidMessage {
        /// The raw message string.
        string: String,
        /// The underlying parse error.
        #[source]
        cause: MessageParseError,
    },
}

/// Errors encountered when parsing a single IRC line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageParseError {
    /// Line was empty (or whitespace only).
    #[error("empty message")]
    EmptyMessage,

    /// No command token after the optional hostmask.
    #[error("missing command")]
    MissingCommand,

    /// Command token contained characters outside the wire grammar.
    #[error("invalid command token: {0}")]
    InvalidCommand(String),
}

/// Outcome classification for message handlers.
///
/// A handler either succeeds, reports a recoverable shortfall (the offending
/// message is dumped and processing continues), or reports a fatal fault
/// that affects the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandlerError {
    /// The message did not carry enough parameters for its handler.
    ///
    /// Recoverable: the dispatcher dumps the raw message and moves on.
    #[error("not enough parameters: expected {expected}, got {got}")]
    NeedMoreParams {
        /// Parameters the handler requires.
        expected: usize,
        /// Parameters actually present.
        got: usize,
    },

    /// The message was malformed beyond recovery.
    #[error("fatal protocol fault: {0}")]
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        let err = ProtocolError::MessageTooLong(512);
        assert_eq!(
            err.to_string(),
            "message too long: 512 bytes without a line terminator"
        );

        let err = HandlerError::NeedMoreParams {
            expected: 2,
            got: 1,
        };
        assert_eq!(err.to_string(), "not enough parameters: expected 2, got 1");
    }

    #[test]
    fn parse_error_source_chaining() {
        let cause = MessageParseError::EmptyMessage;
        let err = ProtocolError::InvalidMessage {
            string: String::new(),
            cause: cause.clone(),
        };

        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), cause.to_string());
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: ProtocolError = io_err.into();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
