//! CTCP: the in-band sub-protocol nested inside PRIVMSG/NOTICE payloads.
//!
//! A CTCP frame is the region between two 0x01 delimiter bytes at the start
//! of a message payload; the first whitespace-delimited token inside is the
//! type (case-insensitive), the remainder is free-text arguments. A frame
//! arriving via `PRIVMSG` is a request, via `NOTICE` a response, and the two
//! directions dispatch through separate type tables.

use tracing::debug;

use crate::chan::ConversationKind;
use crate::error::HandlerError;
use crate::session::Session;

/// The delimiter byte opening and closing a CTCP frame.
pub const CTCP_DELIM: char = '\u{1}';

/// Which direction a CTCP frame travels in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtcpDirection {
    /// Carried by `PRIVMSG`: the peer is asking us something.
    Request,
    /// Carried by `NOTICE`: the peer is answering us.
    Response,
}

/// An extracted CTCP frame borrowing from the message payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtcpFrame<'a> {
    /// Frame type, e.g. `ACTION`, `VERSION`, `PING`.
    pub kind: &'a str,
    /// Free-text arguments (may be empty).
    pub args: &'a str,
}

/// Extract the delimiter-bounded frame from a payload, if it carries one.
///
/// The payload must begin with the delimiter; the frame runs to the next
/// delimiter or, leniently, to end of payload.
pub fn extract(payload: &str) -> Option<CtcpFrame<'_>> {
    let inner = payload.strip_prefix(CTCP_DELIM)?;
    let inner = match inner.find(CTCP_DELIM) {
        Some(end) => &inner[..end],
        None => inner,
    };
    let (kind, args) = match inner.split_once(char::is_whitespace) {
        Some((kind, args)) => (kind, args),
        None => (inner, ""),
    };
    if kind.is_empty() {
        return None;
    }
    Some(CtcpFrame { kind, args })
}

/// Frame a CTCP type and arguments for the wire.
pub fn frame(kind: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{CTCP_DELIM}{kind}{CTCP_DELIM}")
    } else {
        format!("{CTCP_DELIM}{kind} {args}{CTCP_DELIM}")
    }
}

/// Handler for one CTCP type in one direction.
///
/// `sender` is the peer's hostmask, `target` the PRIVMSG/NOTICE target the
/// frame arrived on (a channel name or our own nick).
pub type CtcpHandler =
    fn(&mut Session, sender: Option<&str>, target: &str, args: &str) -> Result<(), HandlerError>;

fn sender_nick(sender: Option<&str>) -> &str {
    sender
        .map(|mask| mask.split('!').next().unwrap_or(mask))
        .unwrap_or("?")
}

/// `ACTION` request: third-person narration in the target conversation.
///
/// If the target is a user not currently tracked, a query conversation is
/// auto-created for the sender.
pub fn action_request(
    session: &mut Session,
    sender: Option<&str>,
    target: &str,
    args: &str,
) -> Result<(), HandlerError> {
    let nick = sender_nick(sender).to_string();
    let id = if session.is_channel_name(target) {
        match session.conversation(target) {
            Some(conv) => conv.id,
            None => session.root_id(),
        }
    } else {
        session
            .ensure_conversation(&nick, ConversationKind::Query)
            .id
    };
    session.display(id, &format!("* {nick} {args}"));
    Ok(())
}

/// `VERSION` request: echo the client identification string.
pub fn version_request(
    session: &mut Session,
    sender: Option<&str>,
    _target: &str,
    _args: &str,
) -> Result<(), HandlerError> {
    let nick = sender_nick(sender).to_string();
    let reply = format!("ircore {} (rust)", env!("CARGO_PKG_VERSION"));
    session.send_ctcp_reply(&nick, "VERSION", &reply);
    Ok(())
}

/// `VERSION` response: display the peer's identification string.
pub fn version_response(
    session: &mut Session,
    sender: Option<&str>,
    _target: &str,
    args: &str,
) -> Result<(), HandlerError> {
    let nick = sender_nick(sender);
    let line = format!("CTCP VERSION reply from {nick}: {args}");
    session.display_root(&line);
    Ok(())
}

/// `PING` request: echo the caller-supplied opaque token back.
pub fn ping_request(
    session: &mut Session,
    sender: Option<&str>,
    _target: &str,
    args: &str,
) -> Result<(), HandlerError> {
    let nick = sender_nick(sender).to_string();
    session.send_ctcp_reply(&nick, "PING", args);
    Ok(())
}

/// `PING` response: the token is our monotonic-clock send timestamp in
/// milliseconds; round-trip latency is now minus token.
pub fn ping_response(
    session: &mut Session,
    sender: Option<&str>,
    _target: &str,
    args: &str,
) -> Result<(), HandlerError> {
    let nick = sender_nick(sender);
    let line = match args.trim().parse::<u64>() {
        Ok(sent) => {
            let elapsed = session.monotonic_millis().saturating_sub(sent);
            format!("CTCP PING reply from {nick}: {}.{:03}s", elapsed / 1000, elapsed % 1000)
        }
        Err(_) => {
            debug!(token = args, "unparseable CTCP PING token");
            format!("CTCP PING reply from {nick} with unparseable token")
        }
    };
    session.display_root(&line);
    Ok(())
}

/// `TIME` request: reply with the local time string.
pub fn time_request(
    session: &mut Session,
    sender: Option<&str>,
    _target: &str,
    _args: &str,
) -> Result<(), HandlerError> {
    let nick = sender_nick(sender).to_string();
    let now = chrono::Local::now().format("%a %b %e %T %Y").to_string();
    session.send_ctcp_reply(&nick, "TIME", &now);
    Ok(())
}
