//! Incremental line framing over a growing receive buffer.
//!
//! Socket reads land in a [`BytesMut`] at the fill position; [`LineBuffer`]
//! extracts `\r\n`-terminated messages one at a time, tracking a consumed
//! cursor. When no terminator is in sight the consumed prefix is compacted
//! away to make room; an unterminated line that fills the whole buffer is a
//! framing fault and poisons the buffer until it is explicitly reset.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::ProtocolError;

/// Maximum length of a single IRC message including the CRLF terminator.
pub const MAX_LINE_LEN: usize = 512;

/// Buffered extraction of CRLF-terminated lines from a byte stream.
///
/// Bytes are appended via [`space`](LineBuffer::space) (or
/// [`extend`](LineBuffer::extend)); [`next_line`](LineBuffer::next_line)
/// yields each complete line with the terminator stripped. A bare `\n`
/// also terminates, matching what servers actually emit.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    cursor: usize,
    max_len: usize,
    poisoned: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineBuffer {
    /// Create a buffer with the standard 512-byte message limit.
    pub fn new() -> Self {
        Self::with_max_len(MAX_LINE_LEN)
    }

    /// Create a buffer with a custom maximum message length.
    pub fn with_max_len(max_len: usize) -> Self {
        LineBuffer {
            buf: BytesMut::with_capacity(max_len),
            cursor: 0,
            max_len,
            poisoned: false,
        }
    }

    /// Append received bytes at the fill position.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The underlying buffer, for appending via `read_buf`.
    ///
    /// Callers must only append; the consumed prefix is managed here.
    pub fn space(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Extract the next complete line, or `Ok(None)` if more bytes are
    /// needed.
    ///
    /// Fails with [`ProtocolError::MessageTooLong`] once an unterminated
    /// line has reached the maximum message length; after that every call
    /// fails until [`reset`](LineBuffer::reset).
    pub fn next_line(&mut self) -> Result<Option<&[u8]>, ProtocolError> {
        if self.poisoned {
            return Err(ProtocolError::MessageTooLong(self.buf.len()));
        }

        // Previous call drained the buffer entirely; restart from zero.
        if self.cursor > 0 && self.cursor == self.buf.len() {
            self.buf.clear();
            self.cursor = 0;
        }

        let pos = self.buf[self.cursor..].iter().position(|&b| b == b'\n');
        match pos {
            Some(pos) => {
                let start = self.cursor;
                let mut end = start + pos;
                self.cursor = end + 1;
                if end > start && self.buf[end - 1] == b'\r' {
                    end -= 1;
                }
                Ok(Some(&self.buf[start..end]))
            }
            None => {
                if self.cursor > 0 {
                    // Compact the consumed prefix so the partial line can
                    // keep growing from offset 0.
                    trace!(consumed = self.cursor, "compacting receive buffer");
                    self.buf.advance(self.cursor);
                    self.cursor = 0;
                }
                if self.buf.len() >= self.max_len {
                    self.poisoned = true;
                    return Err(ProtocolError::MessageTooLong(self.buf.len()));
                }
                Ok(None)
            }
        }
    }

    /// Discard all buffered bytes and clear the poisoned state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.cursor = 0;
        self.poisoned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(buf: &mut LineBuffer) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Some(line)) = buf.next_line() {
            out.push(String::from_utf8_lossy(line).into_owned());
        }
        out
    }

    #[test]
    fn single_line() {
        let mut buf = LineBuffer::new();
        buf.extend(b"PING :abc\r\n");
        assert_eq!(lines(&mut buf), vec!["PING :abc"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn partial_then_complete() {
        let mut buf = LineBuffer::new();
        buf.extend(b"PRIVMSG #chan :hel");
        assert!(matches!(buf.next_line(), Ok(None)));
        buf.extend(b"lo\r\nPING :x\r\n");
        assert_eq!(lines(&mut buf), vec!["PRIVMSG #chan :hello", "PING :x"]);
    }

    #[test]
    fn bare_lf_terminates() {
        let mut buf = LineBuffer::new();
        buf.extend(b"NOTICE a :b\nPING :c\r\n");
        assert_eq!(lines(&mut buf), vec!["NOTICE a :b", "PING :c"]);
    }

    #[test]
    fn compaction_preserves_partial_line() {
        let mut buf = LineBuffer::new();
        buf.extend(b"PING :one\r\nPART");
        assert_eq!(lines(&mut buf), vec!["PING :one"]);
        // The unconsumed remainder was compacted to offset 0.
        buf.extend(b" #chan\r\n");
        assert_eq!(lines(&mut buf), vec!["PART #chan"]);
    }

    #[test]
    fn oversize_line_poisons_until_reset() {
        let mut buf = LineBuffer::with_max_len(16);
        buf.extend(&[b'x'; 16]);
        assert!(matches!(
            buf.next_line(),
            Err(ProtocolError::MessageTooLong(16))
        ));
        // Still poisoned on the next call.
        assert!(buf.next_line().is_err());

        buf.reset();
        buf.extend(b"PING :ok\r\n");
        assert_eq!(lines(&mut buf), vec!["PING :ok"]);
    }

    #[test]
    fn empty_line_yields_empty_slice() {
        let mut buf = LineBuffer::new();
        buf.extend(b"\r\n");
        assert_eq!(buf.next_line().unwrap(), Some(&b""[..]));
    }
}
