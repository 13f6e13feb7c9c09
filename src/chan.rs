//! Channel and query conversation state.
//!
//! A [`Conversation`] is a named context text can be routed to: the
//! network's root, a joined channel, or a private query. Channels carry an
//! ordered membership set; queries cache the peer's away message.

use std::collections::BTreeMap;

use crate::casemap::Casemapping;

/// Identifier for a conversation context, allocated by the external
/// collaborator that owns the actual display surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub u64);

/// Identifier for a network/session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u64);

/// What kind of context a conversation is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationKind {
    /// The network's own output stream (server notices, diagnostics).
    Root,
    /// A joined channel with tracked membership.
    Channel,
    /// A private conversation with one user.
    Query,
}

/// One channel member: a nickname plus its privilege prefixes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    /// Nickname as the server spelled it.
    pub nick: String,
    /// Privilege-prefix symbols, most privileged first.
    prefixes: String,
}

impl Member {
    /// Create a member with no privileges.
    pub fn new(nick: &str) -> Self {
        Member {
            nick: nick.to_string(),
            prefixes: String::new(),
        }
    }

    /// Create a member with an initial prefix set (roster ingestion).
    ///
    /// `ranking` is the network's symbol table, most privileged first;
    /// symbols not in the ranking are ignored.
    pub fn with_prefixes(nick: &str, prefixes: &str, ranking: &str) -> Self {
        let mut member = Member::new(nick);
        for sym in prefixes.chars() {
            member.add_prefix(sym, ranking);
        }
        member
    }

    /// All prefix symbols, most privileged first.
    pub fn prefixes(&self) -> &str {
        &self.prefixes
    }

    /// The symbol shown next to the nick, if any.
    pub fn visible_prefix(&self) -> Option<char> {
        self.prefixes.chars().next()
    }

    /// Insert a prefix symbol at its rank. Duplicate inserts and symbols
    /// absent from the ranking are no-ops.
    pub fn add_prefix(&mut self, symbol: char, ranking: &str) {
        if self.prefixes.contains(symbol) {
            return;
        }
        let Some(rank) = ranking.find(symbol) else {
            return;
        };
        let at = self
            .prefixes
            .chars()
            .position(|existing| ranking.find(existing).map_or(true, |r| r > rank))
            .unwrap_or(self.prefixes.chars().count());
        let byte_at = self
            .prefixes
            .char_indices()
            .nth(at)
            .map_or(self.prefixes.len(), |(i, _)| i);
        self.prefixes.insert(byte_at, symbol);
    }

    /// Remove a prefix symbol if present. Returns whether it was present.
    pub fn remove_prefix(&mut self, symbol: char) -> bool {
        match self.prefixes.find(symbol) {
            Some(i) => {
                self.prefixes.remove(i);
                true
            }
            None => false,
        }
    }
}

/// A named conversation context owned by a session.
#[derive(Debug)]
pub struct Conversation {
    /// Display-surface identifier for this context.
    pub id: ConversationId,
    /// Name as the server spells it (channel name, peer nick, or host).
    pub name: String,
    /// Context kind.
    pub kind: ConversationKind,
    /// Cached away message for the query peer.
    pub away: Option<String>,
    members: BTreeMap<String, Member>,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new(id: ConversationId, name: &str, kind: ConversationKind) -> Self {
        Conversation {
            id,
            name: name.to_string(),
            kind,
            away: None,
            members: BTreeMap::new(),
        }
    }

    /// Insert (or replace) a member keyed by case-folded nickname.
    pub fn add_member(&mut self, member: Member, casemap: Casemapping) {
        self.members.insert(casemap.fold(&member.nick), member);
    }

    /// Remove a member. Returns false if the nickname was not tracked,
    /// which callers report as a (non-fatal) inconsistency.
    pub fn remove_member(&mut self, nick: &str, casemap: Casemapping) -> bool {
        self.members.remove(&casemap.fold(nick)).is_some()
    }

    /// Look up a member by nickname.
    pub fn member(&self, nick: &str, casemap: Casemapping) -> Option<&Member> {
        self.members.get(&casemap.fold(nick))
    }

    /// Look up a member mutably by nickname.
    pub fn member_mut(&mut self, nick: &str, casemap: Casemapping) -> Option<&mut Member> {
        self.members.get_mut(&casemap.fold(nick))
    }

    /// Re-key a member under a new nickname. Returns whether the old
    /// nickname was tracked here.
    pub fn rename_member(&mut self, old: &str, new: &str, casemap: Casemapping) -> bool {
        match self.members.remove(&casemap.fold(old)) {
            Some(mut member) => {
                member.nick = new.to_string();
                self.members.insert(casemap.fold(new), member);
                true
            }
            None => false,
        }
    }

    /// Members in folded-name order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Number of tracked members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Drop every tracked member. Memberships are meaningless across a
    /// disconnect.
    pub fn clear_members(&mut self) {
        self.members.clear();
    }

    /// Re-fold all member keys under a new case mapping.
    pub fn refold_members(&mut self, casemap: Casemapping) {
        let old = std::mem::take(&mut self.members);
        for (_, member) in old {
            self.members.insert(casemap.fold(&member.nick), member);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANKING: &str = "@+";

    #[test]
    fn prefix_insert_keeps_privilege_order() {
        let mut m = Member::new("alice");
        m.add_prefix('+', RANKING);
        m.add_prefix('@', RANKING);
        assert_eq!(m.prefixes(), "@+");
        assert_eq!(m.visible_prefix(), Some('@'));

        let mut m = Member::new("bob");
        m.add_prefix('@', RANKING);
        m.add_prefix('+', RANKING);
        assert_eq!(m.prefixes(), "@+");
    }

    #[test]
    fn duplicate_prefix_is_noop() {
        let mut m = Member::new("alice");
        m.add_prefix('@', RANKING);
        m.add_prefix('@', RANKING);
        assert_eq!(m.prefixes(), "@");
    }

    #[test]
    fn unknown_symbol_ignored() {
        let mut m = Member::new("alice");
        m.add_prefix('?', RANKING);
        assert_eq!(m.prefixes(), "");
    }

    #[test]
    fn removing_only_prefix_clears_visible() {
        let mut m = Member::with_prefixes("alice", "+", RANKING);
        assert!(m.remove_prefix('+'));
        assert_eq!(m.visible_prefix(), None);
        assert!(!m.remove_prefix('+'));
    }

    #[test]
    fn membership_keys_fold() {
        let cm = Casemapping::Rfc1459;
        let mut chan = Conversation::new(ConversationId(1), "#rust", ConversationKind::Channel);
        chan.add_member(Member::new("Nick[1]"), cm);
        assert!(chan.member("nick{1}", cm).is_some());
        assert!(chan.remove_member("NICK[1]", cm));
        assert!(!chan.remove_member("NICK[1]", cm));
    }

    #[test]
    fn rename_rekeys_member() {
        let cm = Casemapping::Rfc1459;
        let mut chan = Conversation::new(ConversationId(1), "#rust", ConversationKind::Channel);
        chan.add_member(Member::with_prefixes("alice", "@", RANKING), cm);

        assert!(chan.rename_member("ALICE", "alicia", cm));
        let m = chan.member("alicia", cm).unwrap();
        assert_eq!(m.nick, "alicia");
        assert_eq!(m.prefixes(), "@");
        assert!(chan.member("alice", cm).is_none());
    }

    #[test]
    fn wider_ranking_orders_between_existing() {
        // admin(&) outranks op(@) outranks voice(+)
        let ranking = "&@+";
        let mut m = Member::new("x");
        m.add_prefix('+', ranking);
        m.add_prefix('&', ranking);
        m.add_prefix('@', ranking);
        assert_eq!(m.prefixes(), "&@+");
    }
}
