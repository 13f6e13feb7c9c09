//! ISUPPORT (numeric 005) token ingestion.
//!
//! The server advertises its feature set as `KEY` or `KEY=value` tokens.
//! Consumed tokens populate the session's [`ServerInfo`]; everything else
//! is logged and ignored. Fields stay at their defaults until the server
//! says otherwise and are reset on disconnect.

use tracing::{debug, warn};

use crate::casemap::Casemapping;

/// Server-advertised attributes for one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server name from the 004 reply.
    pub server_name: Option<String>,
    /// Server software version from the 004 reply.
    pub version: Option<String>,
    /// Network display name (`NETWORK=`).
    pub network: Option<String>,
    /// Valid channel-name prefix characters (`CHANTYPES=`).
    pub chantypes: String,
    /// Channel mode categories A,B,C,D (`CHANMODES=`): address-list,
    /// always-parameter, parameter-on-set-only, no-parameter.
    pub chanmodes: [String; 4],
    /// Privilege mode letters, most privileged first (`PREFIX=`).
    pub prefix_modes: String,
    /// Privilege display symbols, paired positionally with the letters.
    pub prefix_symbols: String,
    /// Ban-exception list supported (`EXCEPTS`).
    pub excepts: bool,
    /// Invite-exception list supported (`INVEX`).
    pub invex: bool,
    /// Caller-ID mode supported (`CALLERID`/`ACCEPT`).
    pub callerid: bool,
    /// Extended LIST search supported (`ELIST=`).
    pub elist: Option<String>,
    /// Active case mapping (`CASEMAPPING=`).
    pub casemapping: Casemapping,
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            server_name: None,
            version: None,
            network: None,
            chantypes: "#&".to_string(),
            chanmodes: [
                "b".to_string(),
                "k".to_string(),
                "l".to_string(),
                "imnpst".to_string(),
            ],
            prefix_modes: "ov".to_string(),
            prefix_symbols: "@+".to_string(),
            excepts: false,
            invex: false,
            callerid: false,
            elist: None,
            casemapping: Casemapping::default(),
        }
    }
}

impl ServerInfo {
    /// Return everything to the unset/default state. Called on disconnect.
    pub fn reset(&mut self) {
        *self = ServerInfo::default();
    }

    /// Whether `name` begins with an advertised channel-type character.
    pub fn is_channel_name(&self, name: &str) -> bool {
        name.chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }

    /// The privilege symbol paired with a mode letter, if any.
    pub fn symbol_for_mode(&self, mode: char) -> Option<char> {
        let i = self.prefix_modes.find(mode)?;
        self.prefix_symbols.chars().nth(i)
    }

    /// Ingest one ISUPPORT token. Returns true if the casemapping changed,
    /// so the caller can re-key its folded tables.
    pub fn apply_token(&mut self, token: &str) -> bool {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };

        match key.to_ascii_uppercase().as_str() {
            "CHANTYPES" => {
                if let Some(v) = value {
                    self.chantypes = v.to_string();
                }
            }
            "CHANMODES" => match value.and_then(parse_chanmodes) {
                Some(modes) => self.chanmodes = modes,
                None => warn!(token, "malformed CHANMODES token ignored"),
            },
            "PREFIX" => match value.and_then(parse_prefix) {
                Some((modes, symbols)) => {
                    self.prefix_modes = modes.to_string();
                    self.prefix_symbols = symbols.to_string();
                }
                // Keep prior prefix state untouched on malformed values.
                None => warn!(token, "malformed PREFIX token ignored"),
            },
            "NETWORK" => self.network = value.map(str::to_string),
            "CASEMAPPING" => {
                let mapping = value.unwrap_or("");
                let parsed = mapping.parse::<Casemapping>().unwrap_or_else(|()| {
                    warn!(mapping, "unrecognized CASEMAPPING, defaulting to rfc1459");
                    Casemapping::Rfc1459
                });
                if parsed != self.casemapping {
                    self.casemapping = parsed;
                    return true;
                }
            }
            "EXCEPTS" => self.excepts = true,
            "INVEX" => self.invex = true,
            "CALLERID" | "ACCEPT" => self.callerid = true,
            "ELIST" => self.elist = value.map(str::to_string),
            _ => debug!(token, "unconsumed ISUPPORT token"),
        }
        false
    }
}

/// Parse a `PREFIX=(modes)symbols` value into its paired halves.
///
/// A missing opening parenthesis is rejected; the caller keeps prior state.
fn parse_prefix(value: &str) -> Option<(&str, &str)> {
    let inner = value.strip_prefix('(')?;
    let (modes, symbols) = inner.split_once(')')?;
    if modes.is_empty() || modes.chars().count() != symbols.chars().count() {
        return None;
    }
    Some((modes, symbols))
}

/// Parse the four comma-separated CHANMODES categories.
fn parse_chanmodes(value: &str) -> Option<[String; 4]> {
    let mut parts = value.splitn(4, ',');
    let a = parts.next()?.to_string();
    let b = parts.next()?.to_string();
    let c = parts.next()?.to_string();
    let d = parts.next()?.to_string();
    Some([a, b, c, d])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_token_pairs_positionally() {
        let mut info = ServerInfo::default();
        info.apply_token("PREFIX=(ov)@+");
        assert_eq!(info.prefix_modes, "ov");
        assert_eq!(info.prefix_symbols, "@+");
        // `o` outranks `v`.
        assert_eq!(info.symbol_for_mode('o'), Some('@'));
        assert_eq!(info.symbol_for_mode('v'), Some('+'));
    }

    #[test]
    fn malformed_prefix_keeps_prior_state() {
        let mut info = ServerInfo::default();
        info.apply_token("PREFIX=(qaohv)~&@%+");
        info.apply_token("PREFIX=ov)@+");
        assert_eq!(info.prefix_modes, "qaohv");
        assert_eq!(info.prefix_symbols, "~&@%+");
    }

    #[test]
    fn chanmodes_categories() {
        let mut info = ServerInfo::default();
        info.apply_token("CHANMODES=beI,k,l,imnpst");
        assert_eq!(info.chanmodes[0], "beI");
        assert_eq!(info.chanmodes[1], "k");
        assert_eq!(info.chanmodes[2], "l");
        assert_eq!(info.chanmodes[3], "imnpst");

        info.apply_token("CHANMODES=only,three,parts");
        assert_eq!(info.chanmodes[0], "beI");
    }

    #[test]
    fn casemapping_change_is_signalled() {
        let mut info = ServerInfo::default();
        assert!(info.apply_token("CASEMAPPING=ascii"));
        assert_eq!(info.casemapping, Casemapping::Ascii);
        assert!(!info.apply_token("CASEMAPPING=ascii"));
    }

    #[test]
    fn unknown_casemapping_defaults_to_rfc1459() {
        let mut info = ServerInfo::default();
        info.apply_token("CASEMAPPING=ascii");
        info.apply_token("CASEMAPPING=utf8mapped");
        assert_eq!(info.casemapping, Casemapping::Rfc1459);
    }

    #[test]
    fn boolean_feature_flags() {
        let mut info = ServerInfo::default();
        info.apply_token("EXCEPTS");
        info.apply_token("INVEX=I");
        info.apply_token("CALLERID=g");
        info.apply_token("ELIST=CMNTU");
        assert!(info.excepts);
        assert!(info.invex);
        assert!(info.callerid);
        assert_eq!(info.elist.as_deref(), Some("CMNTU"));
    }

    #[test]
    fn chantypes_drive_channel_detection() {
        let mut info = ServerInfo::default();
        assert!(info.is_channel_name("#rust"));
        assert!(!info.is_channel_name("nick"));
        info.apply_token("CHANTYPES=#&!+");
        assert!(info.is_channel_name("+listen"));
    }
}
