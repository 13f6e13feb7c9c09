//! IRCv3 capability negotiation, client side.
//!
//! During registration the client sends `CAP LS`, intersects the server's
//! offer against the capabilities this engine knows how to use, requests
//! the intersection with `CAP REQ`, and closes with `CAP END`. Acked
//! capabilities flip flags on the session's capability model.
//!
//! # Reference
//! - IRCv3 Capability Negotiation: <https://ircv3.net/specs/extensions/capability-negotiation>

/// Capabilities this engine understands.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Show every privilege prefix in NAMES rosters, not just the highest.
    MultiPrefix,
    /// SASL authentication during registration.
    Sasl,
    /// Server broadcasts AWAY changes for channel peers.
    AwayNotify,
    /// Anything else the server offered.
    Custom(String),
}

impl Capability {
    /// Wire name of the capability.
    pub fn as_str(&self) -> &str {
        match self {
            Self::MultiPrefix => "multi-prefix",
            Self::Sasl => "sasl",
            Self::AwayNotify => "away-notify",
            Self::Custom(s) => s,
        }
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        match s {
            "multi-prefix" => Self::MultiPrefix,
            "sasl" => Self::Sasl,
            "away-notify" => Self::AwayNotify,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered capability flags for one connection.
///
/// All false until the server acks the capability; cleared on disconnect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapFlags {
    /// `multi-prefix` acked.
    pub multi_prefix: bool,
    /// `sasl` acked.
    pub sasl: bool,
    /// `away-notify` acked.
    pub away_notify: bool,
}

impl CapFlags {
    /// Mark a capability active by wire name. Unknown names are ignored.
    pub fn set(&mut self, name: &str) {
        match Capability::from(name) {
            Capability::MultiPrefix => self.multi_prefix = true,
            Capability::Sasl => self.sasl = true,
            Capability::AwayNotify => self.away_notify = true,
            Capability::Custom(_) => {}
        }
    }

    /// Reset every flag. Called on disconnect.
    pub fn clear(&mut self) {
        *self = CapFlags::default();
    }
}

/// Intersect a server `CAP LS` offer against the known-capability set.
///
/// `want_sasl` gates the `sasl` capability: requesting it without
/// credentials would stall registration waiting for AUTHENTICATE.
/// Offer entries may carry `name=value` suffixes; only the name matters.
pub fn intersect_offer(offered: &str, want_sasl: bool) -> Vec<&str> {
    offered
        .split_whitespace()
        .filter_map(|cap| {
            let name = cap.split('=').next().unwrap_or(cap);
            match Capability::from(name) {
                Capability::MultiPrefix | Capability::AwayNotify => Some(name),
                Capability::Sasl if want_sasl => Some(name),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_keeps_known_caps_only() {
        let offer = "multi-prefix server-time away-notify sasl=PLAIN,EXTERNAL batch";
        let picked = intersect_offer(offer, true);
        assert_eq!(picked, vec!["multi-prefix", "away-notify", "sasl"]);
    }

    #[test]
    fn sasl_skipped_without_credentials() {
        let picked = intersect_offer("sasl multi-prefix", false);
        assert_eq!(picked, vec!["multi-prefix"]);
    }

    #[test]
    fn empty_offer_intersects_empty() {
        assert!(intersect_offer("", true).is_empty());
        assert!(intersect_offer("batch echo-message", true).is_empty());
    }

    #[test]
    fn flags_set_and_clear() {
        let mut flags = CapFlags::default();
        flags.set("multi-prefix");
        flags.set("sasl");
        flags.set("unknown-cap");
        assert!(flags.multi_prefix);
        assert!(flags.sasl);
        assert!(!flags.away_notify);

        flags.clear();
        assert_eq!(flags, CapFlags::default());
    }
}
