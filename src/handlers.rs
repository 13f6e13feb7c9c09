//! Built-in protocol handlers.
//!
//! These populate the default dispatch tables: channel membership
//! bookkeeping, message display, registration plumbing, claim-routed
//! numerics, and the CTCP built-ins.

use tracing::warn;

use crate::chan::{ConversationKind, Member};
use crate::ctcp::{self, CtcpDirection};
use crate::dispatch::Dispatcher;
use crate::error::HandlerError;
use crate::message::MessageRef;
use crate::session::Session;

/// Register every built-in handler.
pub fn install(d: &mut Dispatcher) {
    d.register_command("PING", ping);
    d.register_command("PONG", pong);
    d.register_command("PRIVMSG", privmsg);
    d.register_command("NOTICE", notice);
    d.register_command("JOIN", join);
    d.register_command("PART", part);
    d.register_command("KICK", kick);
    d.register_command("QUIT", quit);
    d.register_command("NICK", nick);
    d.register_command("MODE", mode);
    d.register_command("TOPIC", topic);
    d.register_command("AWAY", away);
    d.register_command("CAP", registration_feed);
    d.register_command("AUTHENTICATE", registration_feed);
    d.register_command("ERROR", server_error);

    d.register_numeric(1, welcome);
    d.register_numeric(4, my_info);
    d.register_numeric(5, isupport);
    d.register_numeric(301, user_away);
    d.register_numeric(332, topic_reply);
    d.register_numeric(353, names_reply);
    d.register_numeric(366, names_end);
    for n in [311, 312, 313, 317, 319] {
        d.register_numeric(n, claim_line);
    }
    d.register_numeric(318, claim_end);
    d.register_numeric(375, claim_line);
    d.register_numeric(372, claim_line);
    d.register_numeric(376, claim_end);
    d.register_numeric(422, claim_end);
    d.register_numeric(421, unknown_command_reply);
    d.register_numeric(432, nick_rejected);
    d.register_numeric(433, nick_rejected);
    for n in [902, 903, 904, 905, 906, 907] {
        d.register_numeric(n, registration_feed);
    }

    d.register_ctcp(CtcpDirection::Request, "ACTION", ctcp::action_request);
    d.register_ctcp(CtcpDirection::Request, "VERSION", ctcp::version_request);
    d.register_ctcp(CtcpDirection::Request, "PING", ctcp::ping_request);
    d.register_ctcp(CtcpDirection::Request, "TIME", ctcp::time_request);
    d.register_ctcp(CtcpDirection::Response, "VERSION", ctcp::version_response);
    d.register_ctcp(CtcpDirection::Response, "PING", ctcp::ping_response);
}

fn need(msg: &MessageRef<'_>, n: usize) -> Result<(), HandlerError> {
    if msg.args.len() < n {
        Err(HandlerError::NeedMoreParams {
            expected: n,
            got: msg.args.len(),
        })
    } else {
        Ok(())
    }
}

fn sender(msg: &MessageRef<'_>) -> Result<String, HandlerError> {
    msg.sender_nick()
        .map(str::to_string)
        .ok_or(HandlerError::NeedMoreParams {
            expected: 1,
            got: 0,
        })
}

// --- liveness ---------------------------------------------------------------

fn ping(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    let token = msg.text().unwrap_or("");
    session.send_raw(&format!("PONG :{token}"));
    Ok(())
}

fn pong(
    _d: &Dispatcher,
    _session: &mut Session,
    _msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    Ok(())
}

// --- chat -------------------------------------------------------------------

fn privmsg(
    d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 1)?;
    let target = msg.args[0];
    // The text is usually trailing but the grammar also allows it as a
    // bare middle parameter.
    let Some(text) = msg.trailing.or_else(|| msg.arg(1)) else {
        return Err(HandlerError::NeedMoreParams {
            expected: 2,
            got: msg.args.len(),
        });
    };

    // CTCP frames nested in the payload divert before normal routing.
    if d.maybe_ctcp(session, CtcpDirection::Request, msg.hostmask, target, text)? {
        return Ok(());
    }

    let from = sender(msg)?;
    deliver_chat(session, &from, target, &format!("<{from}> {text}"));
    Ok(())
}

fn notice(
    d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 1)?;
    let target = msg.args[0];
    let text = msg.trailing.or_else(|| msg.arg(1)).unwrap_or("");

    if d.maybe_ctcp(session, CtcpDirection::Response, msg.hostmask, target, text)? {
        return Ok(());
    }

    // Server notices (no user hostmask) go to the root stream.
    match msg.sender_nick() {
        Some(from) if msg.hostmask.is_some_and(|m| m.contains('!')) => {
            let from = from.to_string();
            deliver_chat(session, &from, target, &format!("-{from}- {text}"));
        }
        _ => session.display_root(text),
    }
    Ok(())
}

/// Route chat text to its conversation: the channel it was sent to, or a
/// query with the sender (auto-created) when it was addressed to us.
fn deliver_chat(session: &mut Session, from: &str, target: &str, line: &str) {
    let id = if session.is_channel_name(target) {
        match session.conversation(target) {
            Some(conv) => conv.id,
            None => {
                warn!(target, "message for untracked channel");
                session.root_id()
            }
        }
    } else {
        session.ensure_conversation(from, ConversationKind::Query).id
    };
    session.display(id, line);
}

// --- membership -------------------------------------------------------------

fn join(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    let who = sender(msg)?;
    let channel = msg
        .arg(0)
        .or(msg.trailing)
        .ok_or(HandlerError::NeedMoreParams {
            expected: 1,
            got: 0,
        })?
        .to_string();

    let cm = session.server.casemapping;
    let me = session.is_me(&who);
    let conv = session.ensure_conversation(&channel, ConversationKind::Channel);
    if !me {
        conv.add_member(Member::new(&who), cm);
    }
    let id = conv.id;
    session.display(id, &format!("{who} has joined {channel}"));
    Ok(())
}

fn part(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 1)?;
    let who = sender(msg)?;
    let channel = msg.args[0].to_string();
    let reason = msg.trailing.unwrap_or("").to_string();

    if session.conversation(&channel).is_none() {
        warn!(channel = %channel, "PART for untracked channel");
        session.display_root(&format!("PART for unknown channel {channel}"));
        return Ok(());
    }

    if session.is_me(&who) {
        session.destroy_conversation(&channel);
        return Ok(());
    }

    let cm = session.server.casemapping;
    let Some(conv) = session.conversation_mut(&channel) else {
        return Ok(());
    };
    let id = conv.id;
    if !conv.remove_member(&who, cm) {
        warn!(channel = %channel, who = %who, "PART for untracked member");
        session.display(id, &format!("{who} parted but was not tracked"));
        return Ok(());
    }
    let line = if reason.is_empty() {
        format!("{who} has left {channel}")
    } else {
        format!("{who} has left {channel} ({reason})")
    };
    session.display(id, &line);
    Ok(())
}

fn kick(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 2)?;
    let who = sender(msg)?;
    let channel = msg.args[0].to_string();
    let victim = msg.args[1].to_string();
    let reason = msg.trailing.unwrap_or("").to_string();

    if session.is_me(&victim) {
        session.display_root(&format!("you were kicked from {channel} by {who} ({reason})"));
        session.destroy_conversation(&channel);
        return Ok(());
    }

    let cm = session.server.casemapping;
    let Some(conv) = session.conversation_mut(&channel) else {
        warn!(channel = %channel, "KICK for untracked channel");
        return Ok(());
    };
    let id = conv.id;
    if !conv.remove_member(&victim, cm) {
        warn!(channel = %channel, victim = %victim, "KICK for untracked member");
    }
    session.display(id, &format!("{victim} was kicked by {who} ({reason})"));
    Ok(())
}

fn quit(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    let who = sender(msg)?;
    let reason = msg.trailing.unwrap_or("").to_string();
    let affected = session.remove_member_everywhere(&who);
    let line = if reason.is_empty() {
        format!("{who} has quit")
    } else {
        format!("{who} has quit ({reason})")
    };
    for id in affected {
        session.display(id, &line);
    }
    Ok(())
}

fn nick(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    let old = sender(msg)?;
    let new = msg
        .arg(0)
        .or(msg.trailing)
        .ok_or(HandlerError::NeedMoreParams {
            expected: 1,
            got: 0,
        })?
        .to_string();

    let affected = session.nick_changed(&old, &new);
    let line = format!("{old} is now known as {new}");
    for id in affected {
        session.display(id, &line);
    }
    Ok(())
}

// --- modes ------------------------------------------------------------------

fn mode(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 1)?;
    let target = msg.args[0];
    if !session.is_channel_name(target) {
        // User modes carry no tracked state; confirmations often arrive
        // with the mode string as a trailing parameter.
        return Ok(());
    }
    let target = target.to_string();
    let modes = msg
        .arg(1)
        .or(msg.trailing)
        .ok_or(HandlerError::NeedMoreParams {
            expected: 2,
            got: msg.args.len(),
        })?
        .to_string();
    let mode_args: Vec<String> = msg
        .args
        .get(2..)
        .unwrap_or(&[])
        .iter()
        .map(|s| s.to_string())
        .collect();
    apply_channel_modes(session, &target, &modes, &mode_args);
    Ok(())
}

/// Walk a channel mode delta, consuming arguments per the server's
/// CHANMODES categories and adjusting member prefixes for privilege
/// mode letters.
fn apply_channel_modes(session: &mut Session, channel: &str, modes: &str, args: &[String]) {
    let cm = session.server.casemapping;
    let prefix_modes = session.server.prefix_modes.clone();
    let ranking = session.server.prefix_symbols.clone();
    let chanmodes = session.server.chanmodes.clone();

    let mut adding = true;
    let mut arg_i = 0;
    for mode in modes.chars() {
        match mode {
            '+' => adding = true,
            '-' => adding = false,
            m if prefix_modes.contains(m) => {
                let Some(nick) = args.get(arg_i) else { break };
                arg_i += 1;
                let Some(symbol) = session.server.symbol_for_mode(m) else {
                    continue;
                };
                let Some(conv) = session.conversation_mut(channel) else {
                    warn!(channel, "MODE for untracked channel");
                    return;
                };
                match conv.member_mut(nick, cm) {
                    Some(member) => {
                        if adding {
                            member.add_prefix(symbol, &ranking);
                        } else {
                            member.remove_prefix(symbol);
                        }
                    }
                    None => warn!(channel, nick = %nick, "MODE for untracked member"),
                }
            }
            // Categories A and B always consume an argument; C only on set.
            m if chanmodes[0].contains(m) || chanmodes[1].contains(m) => arg_i += 1,
            m if chanmodes[2].contains(m) => {
                if adding {
                    arg_i += 1;
                }
            }
            _ => {}
        }
    }
}

fn topic(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 1)?;
    let who = sender(msg)?;
    let channel = msg.args[0];
    let text = msg.trailing.unwrap_or("");
    let id = match session.conversation(channel) {
        Some(conv) => conv.id,
        None => session.root_id(),
    };
    session.display(id, &format!("{who} has changed the topic to: {text}"));
    Ok(())
}

fn away(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    // Sent by servers with away-notify; cache on the peer's query if open.
    let who = sender(msg)?;
    let text = msg.trailing.map(str::to_string);
    if let Some(conv) = session.conversation_mut(&who) {
        if conv.kind == ConversationKind::Query {
            conv.away = text;
        }
    }
    Ok(())
}

// --- registration plumbing --------------------------------------------------

fn registration_feed(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    session.feed_registration(msg);
    Ok(())
}

/// 432/433: retried by the registration machine mid-handshake; once
/// registered, a rejected NICK is reported instead.
fn nick_rejected(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    if session.registration.is_complete() {
        let nick = msg.arg(1).unwrap_or("?");
        let reason = msg.trailing.unwrap_or("nickname rejected");
        session.display_root(&format!("{nick}: {reason}"));
        return Ok(());
    }
    session.feed_registration(msg);
    Ok(())
}

fn server_error(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    let reason = msg.text().unwrap_or("connection terminated by server");
    session.display_root(&format!("server error: {reason}"));
    Err(HandlerError::Fatal(reason.to_string()))
}

fn welcome(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    session.feed_registration(msg);
    // The server's view of our nick is authoritative.
    if let Some(me) = msg.arg(0) {
        let me = me.to_string();
        session.set_nick(&me);
    }
    if let Some(text) = msg.trailing {
        session.display_root(text);
    }
    Ok(())
}

fn my_info(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 3)?;
    session.server.server_name = Some(msg.args[1].to_string());
    session.server.version = Some(msg.args[2].to_string());
    Ok(())
}

fn isupport(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 2)?;
    // args[0] is our nick; the trailing "are supported" text is not a token.
    let mut casemap_changed = false;
    for token in &msg.args[1..] {
        if session.server.apply_token(token) {
            casemap_changed = true;
        }
    }
    if casemap_changed {
        let cm = session.server.casemapping;
        session.apply_casemapping(cm);
    }
    Ok(())
}

// --- claim-routed numerics --------------------------------------------------

/// A reply line in a claimed series: oldest claim's conversation, or the
/// root stream when nothing is outstanding (server-initiated series like
/// the connect-time MOTD).
fn claim_line(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    let id = session.claims.route_pending().unwrap_or(session.root_id());
    let text = match (msg.args.len() > 1, msg.trailing) {
        (true, Some(trailing)) => format!("{} {}", msg.args[1..].join(" "), trailing),
        (true, None) => msg.args[1..].join(" "),
        (false, trailing) => trailing.unwrap_or("").to_string(),
    };
    session.display(id, &text);
    Ok(())
}

/// Terminal numeric of a claimed series: pop the claim.
fn claim_end(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    let id = match session.claims.route_terminal() {
        Some(id) => id,
        None => {
            // The connect-time MOTD ends unclaimed; any other unclaimed
            // terminal is a correlation inconsistency.
            if !matches!(msg.numeric(), Some(376) | Some(422)) {
                warn!(command = msg.command, "terminal reply with no outstanding claim");
            }
            session.root_id()
        }
    };
    if let Some(text) = msg.trailing {
        session.display(id, text);
    }
    Ok(())
}

fn user_away(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 2)?;
    let who = msg.args[1].to_string();
    let text = msg.trailing.unwrap_or("").to_string();

    if let Some(conv) = session.conversation_mut(&who) {
        if conv.kind == ConversationKind::Query {
            conv.away = Some(text.clone());
        }
    }
    let id = session.claims.route_pending().unwrap_or_else(|| {
        session
            .conversation(&who)
            .map(|c| c.id)
            .unwrap_or(session.root_id())
    });
    session.display(id, &format!("{who} is away: {text}"));
    Ok(())
}

fn topic_reply(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 2)?;
    let channel = msg.args[1];
    let text = msg.trailing.unwrap_or("");
    let id = match session.conversation(channel) {
        Some(conv) => conv.id,
        None => session.root_id(),
    };
    session.display(id, &format!("topic for {channel}: {text}"));
    Ok(())
}

fn unknown_command_reply(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    session.feed_registration(msg);
    session.dump_message(msg);
    Ok(())
}

// --- rosters ----------------------------------------------------------------

fn names_reply(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 3)?;
    let channel = msg.args[2].to_string();
    let roster = msg.trailing.unwrap_or("").to_string();

    let cm = session.server.casemapping;
    let ranking = session.server.prefix_symbols.clone();
    let conv = session.ensure_conversation(&channel, ConversationKind::Channel);
    for entry in roster.split_whitespace() {
        let prefixes: String = entry.chars().take_while(|c| ranking.contains(*c)).collect();
        let nick = &entry[prefixes.len()..];
        if nick.is_empty() {
            continue;
        }
        conv.add_member(Member::with_prefixes(nick, &prefixes, &ranking), cm);
    }
    Ok(())
}

fn names_end(
    _d: &Dispatcher,
    session: &mut Session,
    msg: &MessageRef<'_>,
) -> Result<(), HandlerError> {
    need(msg, 2)?;
    let channel = msg.args[1];
    if let Some(conv) = session.conversation(channel) {
        let id = conv.id;
        let count = conv.member_count();
        session.display(id, &format!("{count} users on {channel}"));
    }
    Ok(())
}
