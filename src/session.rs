//! Per-network session state and the narrow contracts to the outside.
//!
//! A [`Session`] owns everything one connection knows: configuration,
//! status, the server's advertised attributes, capability flags, the claim
//! queue, and the conversation set. It talks outward through exactly one
//! trait, [`ClientUi`], and it never performs I/O itself: outgoing lines
//! accumulate in an outbox the connection driver drains, and display text
//! accumulates in a mutex-guarded queue drained on the driver's idle turn.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use crate::casemap::Casemapping;
use crate::chan::{Conversation, ConversationId, ConversationKind, NetworkId};
use crate::caps::CapFlags;
use crate::claims::ClaimQueue;
use crate::ctcp;
use crate::isupport::ServerInfo;
use crate::message::MessageRef;
use crate::registry::Registry;
use crate::state::{ConnStatus, Identity, RegAction, RegistrationMachine};
use crate::util::truncate_utf8_safe;

/// Maximum content bytes in one outgoing line (512 minus CRLF).
const MAX_OUT_LINE: usize = 510;

/// What the engine asks of its embedder.
///
/// The display side of the client implements this; the engine never knows
/// about windows, widgets, or layout.
pub trait ClientUi: Send + Sync {
    /// Append a line of text to a conversation's output stream.
    fn display(&self, target: ConversationId, text: &str);
    /// Look up or create the display context for a named conversation.
    fn resolve_or_create_conversation(&self, network: NetworkId, name: &str) -> ConversationId;
    /// Tear down a conversation's display context.
    fn destroy_conversation(&self, target: ConversationId);
    /// The connection's lifecycle state changed.
    fn notify_status_changed(&self, network: NetworkId, status: ConnStatus);
}

/// Mutex-guarded queue of display output.
///
/// Producers (the protocol core, and the background resolver for early
/// connection messages) push; the event loop drains to the [`ClientUi`] on
/// its next idle turn. This is the only lock in the engine.
#[derive(Debug, Default)]
pub struct DisplayQueue {
    inner: Mutex<VecDeque<(ConversationId, String)>>,
}

impl DisplayQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<(ConversationId, String)>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a line for a conversation.
    pub fn push(&self, target: ConversationId, text: &str) {
        self.lock().push_back((target, text.to_string()));
    }

    /// Hand every queued line to the display collaborator.
    pub fn drain_to(&self, ui: &dyn ClientUi) {
        // Take the batch under the lock, deliver outside it.
        let batch: Vec<_> = self.lock().drain(..).collect();
        for (target, text) in batch {
            ui.display(target, &text);
        }
    }
}

/// Connection configuration for one network.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Server host name or address literal.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Whether to wrap the stream in TLS.
    pub tls: bool,
    /// Identity used during registration.
    pub identity: Identity,
}

/// All protocol state for one network connection.
pub struct Session {
    /// Session identifier, chosen by the embedder.
    pub id: NetworkId,
    /// Connection configuration.
    pub config: ServerConfig,
    /// Server-advertised attributes (ISUPPORT, 004).
    pub server: ServerInfo,
    /// Acked capability flags.
    pub caps: CapFlags,
    /// Outstanding request/reply claims.
    pub claims: ClaimQueue,
    /// Registration sequencer.
    pub registration: RegistrationMachine,
    /// Tear the session down fully once `Disconnected` is reached again.
    pub destroy_on_disconnect: bool,
    status: ConnStatus,
    conversations: Registry<Conversation>,
    root: ConversationId,
    nick: String,
    ui: Arc<dyn ClientUi>,
    display: Arc<DisplayQueue>,
    outbox: VecDeque<String>,
    started: Instant,
}

impl Session {
    /// Create a session and its root conversation.
    pub fn new(id: NetworkId, config: ServerConfig, ui: Arc<dyn ClientUi>) -> Self {
        let root = ui.resolve_or_create_conversation(id, &config.host);
        let mut conversations = Registry::new(Casemapping::default());
        let root_conv = Conversation::new(root, &config.host, ConversationKind::Root);
        conversations.insert(&config.host, root_conv);
        let nick = config.identity.nickname.clone();
        let registration = RegistrationMachine::new(config.identity.clone());
        Session {
            id,
            config,
            server: ServerInfo::default(),
            caps: CapFlags::default(),
            claims: ClaimQueue::new(),
            registration,
            destroy_on_disconnect: false,
            status: ConnStatus::Disconnected,
            conversations,
            root,
            nick,
            ui,
            display: Arc::new(DisplayQueue::default()),
            outbox: VecDeque::new(),
            started: Instant::now(),
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ConnStatus {
        self.status
    }

    /// Move to a new status and notify the embedder.
    pub fn set_status(&mut self, status: ConnStatus) {
        if self.status != status {
            debug!(from = %self.status, to = %status, "connection status change");
            self.status = status;
            self.ui.notify_status_changed(self.id, status);
        }
    }

    /// The nickname currently in effect.
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Whether a nickname refers to us under the active case mapping.
    pub fn is_me(&self, nick: &str) -> bool {
        self.server.casemapping.eq(nick, &self.nick)
    }

    /// Record our own nickname change.
    pub fn set_nick(&mut self, nick: &str) {
        self.nick = nick.to_string();
    }

    /// The root conversation's display id.
    pub fn root_id(&self) -> ConversationId {
        self.root
    }

    /// The shared display queue (handed to background producers).
    pub fn display_queue(&self) -> Arc<DisplayQueue> {
        Arc::clone(&self.display)
    }

    /// Milliseconds on this session's monotonic clock. Used as the CTCP
    /// PING token.
    pub fn monotonic_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Whether `name` looks like a channel under the server's CHANTYPES.
    pub fn is_channel_name(&self, name: &str) -> bool {
        self.server.is_channel_name(name)
    }

    // --- display -----------------------------------------------------------

    /// Queue text for a conversation's output stream.
    pub fn display(&self, target: ConversationId, text: &str) {
        self.display.push(target, text);
    }

    /// Queue text for the network's root stream.
    pub fn display_root(&self, text: &str) {
        self.display.push(self.root, text);
    }

    /// Drain queued display output to the embedder. Called on the event
    /// loop's idle turn.
    pub fn flush_display(&self) {
        self.display.drain_to(&*self.ui);
    }

    /// Diagnostic dump of a message nothing claimed: hostmask plus
    /// arguments, to the root stream. State is left unchanged.
    pub fn dump_message(&self, msg: &MessageRef<'_>) {
        let mut line = String::new();
        if let Some(mask) = msg.hostmask {
            line.push_str(mask);
            line.push(' ');
        }
        line.push_str(msg.command);
        for arg in &msg.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(trailing) = msg.trailing {
            line.push_str(" :");
            line.push_str(trailing);
        }
        self.display_root(&line);
    }

    // --- conversations -----------------------------------------------------

    /// Look up a conversation by name.
    pub fn conversation(&self, name: &str) -> Option<&Conversation> {
        self.conversations.get(name)
    }

    /// Look up a conversation mutably by name.
    pub fn conversation_mut(&mut self, name: &str) -> Option<&mut Conversation> {
        self.conversations.get_mut(name)
    }

    /// Look up or create a conversation, resolving its display context
    /// through the embedder.
    pub fn ensure_conversation(
        &mut self,
        name: &str,
        kind: ConversationKind,
    ) -> &mut Conversation {
        if self.conversations.get(name).is_none() {
            let id = self.ui.resolve_or_create_conversation(self.id, name);
            self.conversations
                .insert(name, Conversation::new(id, name, kind));
        }
        self.conversations
            .get_mut(name)
            .expect("conversation present after insert")
    }

    /// Destroy a conversation and its display context.
    pub fn destroy_conversation(&mut self, name: &str) {
        match self.conversations.remove(name) {
            Some(conv) => self.ui.destroy_conversation(conv.id),
            None => warn!(name, "destroy of untracked conversation"),
        }
    }

    /// Iterate over tracked conversations.
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter().map(|(_, c)| c)
    }

    /// Re-key every folded table after a CASEMAPPING change.
    pub fn apply_casemapping(&mut self, casemap: Casemapping) {
        self.conversations.set_casemapping(casemap);
        for conv in self.conversations.values_mut() {
            conv.refold_members(casemap);
        }
    }

    /// Re-key a nickname across every conversation it appears in, renaming
    /// any query conversation whose peer changed nickname. Returns the ids
    /// of the affected conversations.
    pub fn nick_changed(&mut self, old: &str, new: &str) -> Vec<ConversationId> {
        let cm = self.server.casemapping;
        if cm.eq(old, &self.nick) {
            self.nick = new.to_string();
        }

        let mut affected = Vec::new();
        for conv in self.conversations.values_mut() {
            match conv.kind {
                ConversationKind::Channel => {
                    if conv.rename_member(old, new, cm) {
                        affected.push(conv.id);
                    }
                }
                ConversationKind::Query => {
                    if cm.eq(&conv.name, old) {
                        conv.name = new.to_string();
                        affected.push(conv.id);
                    }
                }
                ConversationKind::Root => {}
            }
        }
        // The query's registry key follows its peer.
        self.conversations.rename(old, new);
        affected
    }

    /// Remove a nickname from every channel it appears in (quit,
    /// collision cleanup). Returns the ids of the affected conversations.
    pub fn remove_member_everywhere(&mut self, nick: &str) -> Vec<ConversationId> {
        let cm = self.server.casemapping;
        let mut affected = Vec::new();
        for conv in self.conversations.values_mut() {
            if conv.kind == ConversationKind::Channel && conv.remove_member(nick, cm) {
                affected.push(conv.id);
            }
        }
        affected
    }

    // --- outgoing ----------------------------------------------------------

    /// Queue a raw protocol line for sending (terminator added by the
    /// driver). Overlong lines are truncated at a UTF-8 boundary.
    pub fn send_raw(&mut self, line: &str) {
        let line = truncate_utf8_safe(line, MAX_OUT_LINE);
        self.outbox.push_back(line.to_string());
    }

    /// Next queued outgoing line, if any.
    pub fn take_outgoing(&mut self) -> Option<String> {
        self.outbox.pop_front()
    }

    /// Whether outgoing lines are queued.
    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Send a PRIVMSG and echo it locally if the target is tracked.
    pub fn send_privmsg(&mut self, target: &str, text: &str) {
        self.send_raw(&format!("PRIVMSG {target} :{text}"));
        if let Some(conv) = self.conversations.get(target) {
            let line = format!("<{}> {}", self.nick, text);
            self.display.push(conv.id, &line);
        }
    }

    /// Send a NOTICE.
    pub fn send_notice(&mut self, target: &str, text: &str) {
        self.send_raw(&format!("NOTICE {target} :{text}"));
    }

    /// Send a CTCP request inside a PRIVMSG.
    pub fn send_ctcp(&mut self, target: &str, kind: &str, args: &str) {
        let payload = ctcp::frame(kind, args);
        self.send_raw(&format!("PRIVMSG {target} :{payload}"));
    }

    /// Send a CTCP response inside a NOTICE.
    pub fn send_ctcp_reply(&mut self, target: &str, kind: &str, args: &str) {
        let payload = ctcp::frame(kind, args);
        self.send_raw(&format!("NOTICE {target} :{payload}"));
    }

    /// Send a CTCP PING carrying our monotonic-clock timestamp.
    pub fn send_ctcp_ping(&mut self, target: &str) {
        let token = self.monotonic_millis().to_string();
        self.send_ctcp(target, "PING", &token);
    }

    /// Record that the command just issued expects replies directed at
    /// `target`.
    pub fn claim_response(&mut self, target: ConversationId, payload: Box<dyn Any + Send>) {
        self.claims.claim(target, payload);
    }

    // --- registration and teardown -----------------------------------------

    /// Begin the registration sequence (driver calls this once the
    /// transport is up).
    pub fn begin_registration(&mut self) {
        self.set_status(ConnStatus::Registering);
        let actions = self.registration.start();
        self.apply_reg_actions(actions);
    }

    /// Feed a message to the registration sequencer.
    pub fn feed_registration(&mut self, msg: &MessageRef<'_>) {
        let actions = self.registration.feed(msg, &mut self.caps);
        self.apply_reg_actions(actions);
    }

    fn apply_reg_actions(&mut self, actions: Vec<RegAction>) {
        for action in actions {
            match action {
                RegAction::Send(line) => self.send_raw(&line),
                RegAction::Complete => {
                    self.nick = self.registration.nick().to_string();
                    self.set_status(ConnStatus::Connected);
                }
                RegAction::Report(text) => self.display_root(&text),
            }
        }
    }

    /// Tear down per-connection state after the socket is gone.
    ///
    /// Capability and ISUPPORT fields return to unset, outstanding claims
    /// are drained, channel memberships are cleared. With
    /// `destroy_on_disconnect` set, every conversation (root included) is
    /// destroyed and the session is finished.
    pub fn handle_disconnect(&mut self) {
        self.caps.clear();
        self.server.reset();
        self.claims.drain();
        self.outbox.clear();
        self.registration = RegistrationMachine::new(self.config.identity.clone());
        self.nick = self.config.identity.nickname.clone();

        if self.destroy_on_disconnect {
            for (_, conv) in self.conversations.drain() {
                self.ui.destroy_conversation(conv.id);
            }
        } else {
            for conv in self.conversations.values_mut() {
                conv.clear_members();
            }
        }
        self.set_status(ConnStatus::Disconnected);
        self.flush_display();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("host", &self.config.host)
            .field("status", &self.status)
            .field("nick", &self.nick)
            .field("conversations", &self.conversations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Recording [`ClientUi`] for tests.
    #[derive(Default)]
    pub struct RecordingUi {
        next_id: AtomicU64,
        pub displayed: Mutex<Vec<(ConversationId, String)>>,
        pub destroyed: Mutex<Vec<ConversationId>>,
        pub statuses: Mutex<Vec<ConnStatus>>,
    }

    impl ClientUi for RecordingUi {
        fn display(&self, target: ConversationId, text: &str) {
            self.displayed
                .lock()
                .unwrap()
                .push((target, text.to_string()));
        }

        fn resolve_or_create_conversation(
            &self,
            _network: NetworkId,
            _name: &str,
        ) -> ConversationId {
            ConversationId(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy_conversation(&self, target: ConversationId) {
            self.destroyed.lock().unwrap().push(target);
        }

        fn notify_status_changed(&self, _network: NetworkId, status: ConnStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    pub fn test_config() -> ServerConfig {
        ServerConfig {
            host: "irc.example.net".to_string(),
            port: 6667,
            tls: false,
            identity: Identity {
                nickname: "testbot".to_string(),
                username: "bot".to_string(),
                realname: "Test Bot".to_string(),
                password: None,
                sasl: None,
            },
        }
    }

    pub fn test_session() -> (Session, Arc<RecordingUi>) {
        let ui = Arc::new(RecordingUi::default());
        let session = Session::new(NetworkId(1), test_config(), ui.clone());
        (session, ui)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::chan::Member;

    #[test]
    fn display_is_queued_until_flushed() {
        let (session, ui) = test_session();
        session.display_root("hello");
        assert!(ui.displayed.lock().unwrap().is_empty());

        session.flush_display();
        let displayed = ui.displayed.lock().unwrap();
        assert_eq!(displayed.len(), 1);
        assert_eq!(displayed[0].1, "hello");
    }

    #[test]
    fn ensure_conversation_is_idempotent() {
        let (mut session, _ui) = test_session();
        let id = session
            .ensure_conversation("#rust", ConversationKind::Channel)
            .id;
        let again = session
            .ensure_conversation("#RUST", ConversationKind::Channel)
            .id;
        assert_eq!(id, again);
    }

    #[test]
    fn nick_change_rekeys_members_and_queries() {
        let (mut session, _ui) = test_session();
        let cm = session.server.casemapping;

        session
            .ensure_conversation("#rust", ConversationKind::Channel)
            .add_member(Member::new("alice"), cm);
        session.ensure_conversation("alice", ConversationKind::Query);

        let affected = session.nick_changed("alice", "alicia");
        assert_eq!(affected.len(), 2);

        let chan = session.conversation("#rust").unwrap();
        assert!(chan.member("alicia", cm).is_some());
        assert!(chan.member("alice", cm).is_none());

        let query = session.conversation("alicia").unwrap();
        assert_eq!(query.name, "alicia");
        assert!(session.conversation("alice").is_none());
    }

    #[test]
    fn own_nick_follows_changes() {
        let (mut session, _ui) = test_session();
        session.nick_changed("testbot", "testbot2");
        assert_eq!(session.nick(), "testbot2");
        assert!(session.is_me("TESTBOT2"));
    }

    #[test]
    fn disconnect_resets_negotiated_state() {
        let (mut session, _ui) = test_session();
        session.caps.set("multi-prefix");
        session.server.apply_token("NETWORK=TestNet");
        session.claims.claim(session.root_id(), Box::new(()));
        session.send_raw("PING :x");

        session.handle_disconnect();
        assert!(!session.caps.multi_prefix);
        assert_eq!(session.server.network, None);
        assert!(session.claims.is_empty());
        assert!(!session.has_outgoing());
        assert_eq!(session.status(), ConnStatus::Disconnected);
    }

    #[test]
    fn destroy_on_disconnect_tears_down_conversations() {
        let (mut session, ui) = test_session();
        session.ensure_conversation("#rust", ConversationKind::Channel);
        session.destroy_on_disconnect = true;

        session.handle_disconnect();
        // Root plus the channel.
        assert_eq!(ui.destroyed.lock().unwrap().len(), 2);
    }

    #[test]
    fn overlong_outgoing_lines_are_truncated() {
        let (mut session, _ui) = test_session();
        let long = format!("PRIVMSG #chan :{}", "x".repeat(600));
        session.send_raw(&long);
        let sent = session.take_outgoing().unwrap();
        assert_eq!(sent.len(), 510);
    }

    #[test]
    fn registration_end_to_end_without_caps() {
        let (mut session, _ui) = test_session();
        session.begin_registration();
        assert_eq!(session.status(), ConnStatus::Registering);
        let mut sent = Vec::new();
        while let Some(line) = session.take_outgoing() {
            sent.push(line);
        }
        assert_eq!(
            sent,
            vec!["CAP LS 302", "NICK testbot", "USER bot 0 * :Test Bot"]
        );

        let ls = MessageRef::parse(":server CAP * LS :batch").unwrap();
        session.feed_registration(&ls);
        assert_eq!(session.take_outgoing().as_deref(), Some("CAP END"));

        let welcome = MessageRef::parse(":server 001 testbot :Welcome").unwrap();
        session.feed_registration(&welcome);
        assert_eq!(session.status(), ConnStatus::Connected);
    }
}
