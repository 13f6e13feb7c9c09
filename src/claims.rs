//! Correlation of issued commands with their eventual server replies.
//!
//! Most IRC numeric replies carry no token linking them back to the request
//! that caused them; order of issue is the only correlation available. Each
//! client command that expects a directed reply pushes a claim naming the
//! conversation its replies belong in; numeric handlers consult the oldest
//! claim to route the reply, and pop it when the terminal numeric of the
//! series arrives.
//!
//! Strict FIFO is a known limitation: a server interleaving replies to two
//! outstanding commands out of order will be routed wrongly. The protocol
//! offers nothing better without `labeled-response`.

use std::any::Any;
use std::collections::VecDeque;

use crate::chan::ConversationId;

/// One outstanding request/reply pairing.
pub struct ResponseClaim {
    /// Conversation the reply series should land in.
    pub target: ConversationId,
    /// Opaque caller payload; dropped when the claim is consumed.
    pub payload: Box<dyn Any + Send>,
}

impl std::fmt::Debug for ResponseClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseClaim")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// FIFO of outstanding response claims for one network.
#[derive(Debug, Default)]
pub struct ClaimQueue {
    queue: VecDeque<ResponseClaim>,
}

impl ClaimQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that an issued command expects replies directed at `target`.
    pub fn claim(&mut self, target: ConversationId, payload: Box<dyn Any + Send>) {
        self.queue.push_back(ResponseClaim { target, payload });
    }

    /// Route a non-terminal reply: the oldest claim's conversation, without
    /// consuming the claim.
    pub fn route_pending(&self) -> Option<ConversationId> {
        self.queue.front().map(|c| c.target)
    }

    /// Route a terminal reply: pop the oldest claim (dropping its payload)
    /// and return its conversation.
    pub fn route_terminal(&mut self) -> Option<ConversationId> {
        self.queue.pop_front().map(|c| c.target)
    }

    /// Pop the oldest claim whole, payload included.
    pub fn resolve_oldest(&mut self) -> Option<ResponseClaim> {
        self.queue.pop_front()
    }

    /// Drop every outstanding claim. Called on disconnect.
    pub fn drain(&mut self) {
        self.queue.clear();
    }

    /// Number of outstanding claims.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no claims are outstanding.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn claims_resolve_in_fifo_order() {
        let mut q = ClaimQueue::new();
        q.claim(ConversationId(1), Box::new("whois"));
        q.claim(ConversationId(2), Box::new("motd"));

        assert_eq!(q.route_pending(), Some(ConversationId(1)));
        assert_eq!(q.route_pending(), Some(ConversationId(1)));
        assert_eq!(q.route_terminal(), Some(ConversationId(1)));
        assert_eq!(q.route_pending(), Some(ConversationId(2)));
        assert_eq!(q.route_terminal(), Some(ConversationId(2)));
    }

    #[test]
    fn empty_queue_routes_nowhere() {
        let mut q = ClaimQueue::new();
        assert_eq!(q.route_pending(), None);
        assert_eq!(q.route_terminal(), None);
        assert!(q.resolve_oldest().is_none());
    }

    #[test]
    fn consuming_a_claim_drops_its_payload() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut q = ClaimQueue::new();
        q.claim(ConversationId(1), Box::new(DropCounter(drops.clone())));

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        q.route_terminal();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_drops_every_payload() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut q = ClaimQueue::new();
        for i in 0..3 {
            q.claim(ConversationId(i), Box::new(DropCounter(drops.clone())));
        }

        q.drain();
        assert!(q.is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn resolve_oldest_hands_payload_back() {
        let mut q = ClaimQueue::new();
        q.claim(ConversationId(9), Box::new(42u32));
        let claim = q.resolve_oldest().unwrap();
        assert_eq!(claim.target, ConversationId(9));
        assert_eq!(claim.payload.downcast_ref::<u32>(), Some(&42));
    }
}
