//! IRC message tokenization.
//!
//! One framed line becomes an optional sender hostmask, a command (or
//! three-digit numeric), up to fourteen positional parameters, and an
//! optional trailing free-text parameter. All fields borrow from the
//! input line.

use nom::{
    bytes::complete::take_while1,
    character::complete::char,
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::MessageParseError;

/// Maximum number of positional parameters in one message.
pub const MAX_PARAMS: usize = 14;

/// A tokenized IRC message borrowing from its source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRef<'a> {
    /// Sender identity (`nick!user@host` or a server name), if present.
    pub hostmask: Option<&'a str>,
    /// Command name or numeric token, as received.
    pub command: &'a str,
    /// Positional parameters, at most [`MAX_PARAMS`].
    pub args: Vec<&'a str>,
    /// Trailing free-text parameter, if present.
    pub trailing: Option<&'a str>,
    /// The raw line this message was parsed from.
    pub raw: &'a str,
}

fn parse_hostmask(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

fn parse_command(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric())(input)
}

impl<'a> MessageRef<'a> {
    /// Tokenize a single line (terminator already stripped).
    ///
    /// Malformed lines (empty, or no command token) are errors; the
    /// dispatcher drops them without dispatch.
    pub fn parse(line: &'a str) -> Result<Self, MessageParseError> {
        let raw = line;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(MessageParseError::EmptyMessage);
        }

        let (rest, hostmask) =
            opt(parse_hostmask)(line).map_err(|_| MessageParseError::MissingCommand)?;
        let rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(MessageParseError::MissingCommand);
        }

        let (mut rest, command) = parse_command(rest)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| {
                MessageParseError::InvalidCommand(rest.to_string())
            })?;

        let mut args = Vec::new();
        let mut trailing = None;

        while let Some(stripped) = rest.strip_prefix(' ') {
            let token = stripped.trim_start_matches(' ');
            if token.is_empty() {
                break;
            }
            if let Some(t) = token.strip_prefix(':') {
                // Everything after the colon, spaces included.
                trailing = Some(t);
                rest = "";
                break;
            }
            if args.len() == MAX_PARAMS {
                // Classic grammar: the fifteenth parameter takes the rest
                // of the line even without a colon.
                trailing = Some(token);
                rest = "";
                break;
            }
            let end = token.find(' ').unwrap_or(token.len());
            args.push(&token[..end]);
            rest = &token[end..];
        }

        Ok(MessageRef {
            hostmask,
            command,
            args,
            trailing,
            raw,
        })
    }

    /// The numeric value of a three-digit reply token.
    ///
    /// A token is a numeric reply only when it reduces to exactly three
    /// ASCII digits; anything else is treated as a named command.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// Positional parameter by index.
    pub fn arg(&self, i: usize) -> Option<&'a str> {
        self.args.get(i).copied()
    }

    /// The trailing parameter, or the last positional one.
    ///
    /// Many commands allow their final argument with or without a colon;
    /// handlers use this when either spelling is legal.
    pub fn text(&self) -> Option<&'a str> {
        self.trailing.or_else(|| self.args.last().copied())
    }

    /// The nickname portion of the hostmask, if any.
    pub fn sender_nick(&self) -> Option<&'a str> {
        let mask = self.hostmask?;
        Some(mask.split('!').next().unwrap_or(mask))
    }
}
