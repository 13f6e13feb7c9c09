//! Connection status and registration sequencing.
//!
//! [`ConnStatus`] names every stage of a connection's life; the
//! [`RegistrationMachine`] is the sans-IO piece that drives identity
//! (`NICK`/`USER`/`PASS`) and capability negotiation once a transport is
//! up. It consumes parsed messages and produces actions (lines to send,
//! completion, reports); the connection driver performs the I/O.

use tracing::{debug, warn};

use crate::caps::{intersect_offer, CapFlags};
use crate::message::MessageRef;
use crate::sasl::{encode_plain, SaslCredentials};

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnStatus {
    /// No socket; idle.
    #[default]
    Disconnected,
    /// Background DNS resolution in flight.
    Resolving,
    /// Stream connect attempts in progress.
    Connecting,
    /// TLS handshake in progress (retried on would-block).
    TlsHandshake,
    /// Peer-requested renegotiation in progress.
    ///
    /// Entered only when the session supports safe renegotiation; with
    /// rustls that is never, so renegotiation requests are rejected and
    /// the session continues in `Connected`.
    TlsRehandshake,
    /// Transport up; identity and CAP negotiation underway.
    Registering,
    /// Welcome received; fully connected.
    Connected,
}

impl std::fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnStatus::Disconnected => "disconnected",
            ConnStatus::Resolving => "resolving address",
            ConnStatus::Connecting => "connecting",
            ConnStatus::TlsHandshake => "TLS handshake",
            ConnStatus::TlsRehandshake => "TLS renegotiation",
            ConnStatus::Registering => "registering",
            ConnStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Identity configuration the registration sequence needs.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Desired nickname.
    pub nickname: String,
    /// Username (ident).
    pub username: String,
    /// Real name / GECOS.
    pub realname: String,
    /// Server password, if required.
    pub password: Option<String>,
    /// SASL credentials, if authentication is desired.
    pub sasl: Option<SaslCredentials>,
}

/// Actions produced by the registration machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegAction {
    /// Send this raw line to the server.
    Send(String),
    /// Registration finished; the connection is fully up.
    Complete,
    /// A non-fatal problem worth surfacing (SASL failure, nick retry).
    Report(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegPhase {
    Idle,
    CapNegotiation,
    Authenticating,
    AwaitingWelcome,
    Done,
}

/// Sans-IO driver for the `NICK`/`USER`/`CAP`/`AUTHENTICATE` sequence.
#[derive(Clone, Debug)]
pub struct RegistrationMachine {
    identity: Identity,
    phase: RegPhase,
    /// Nickname of the current attempt (may grow on collisions).
    nick: String,
    offered: String,
    waiting_more_caps: bool,
    cap_ended: bool,
}

impl RegistrationMachine {
    /// Create an idle machine for the given identity.
    pub fn new(identity: Identity) -> Self {
        let nick = identity.nickname.clone();
        RegistrationMachine {
            identity,
            phase: RegPhase::Idle,
            nick,
            offered: String::new(),
            waiting_more_caps: false,
            cap_ended: false,
        }
    }

    /// Nickname currently in use (tracks collision fallbacks).
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Whether the welcome numeric has been processed.
    pub fn is_complete(&self) -> bool {
        self.phase == RegPhase::Done
    }

    /// Begin registration: identity lines plus `CAP LS`.
    pub fn start(&mut self) -> Vec<RegAction> {
        self.phase = RegPhase::CapNegotiation;
        self.offered.clear();
        self.cap_ended = false;
        self.nick = self.identity.nickname.clone();

        let mut actions = Vec::new();
        if let Some(pass) = &self.identity.password {
            actions.push(RegAction::Send(format!("PASS :{pass}")));
        }
        actions.push(RegAction::Send("CAP LS 302".to_string()));
        actions.push(RegAction::Send(format!("NICK {}", self.nick)));
        actions.push(RegAction::Send(format!(
            "USER {} 0 * :{}",
            self.identity.username, self.identity.realname
        )));
        actions
    }

    /// Feed a server message; returns actions for the driver.
    pub fn feed(&mut self, msg: &MessageRef<'_>, caps: &mut CapFlags) -> Vec<RegAction> {
        if matches!(self.phase, RegPhase::Idle | RegPhase::Done) {
            return Vec::new();
        }

        if msg.command.eq_ignore_ascii_case("CAP") {
            return self.handle_cap(msg, caps);
        }
        if msg.command.eq_ignore_ascii_case("AUTHENTICATE") {
            return self.handle_authenticate(msg);
        }

        match msg.numeric() {
            // Welcome: registered, with or without an explicit CAP exchange.
            Some(1) => {
                self.phase = RegPhase::Done;
                vec![RegAction::Complete]
            }
            // Nick collision during registration: append and retry.
            Some(432) | Some(433) => {
                self.nick.push('_');
                vec![
                    RegAction::Report(format!("nickname in use, trying {}", self.nick)),
                    RegAction::Send(format!("NICK {}", self.nick)),
                ]
            }
            // Server does not understand CAP at all.
            Some(421) if msg.arg(1).is_some_and(|c| c.eq_ignore_ascii_case("CAP")) => {
                debug!("server lacks CAP support, finishing registration");
                self.finish_negotiation()
            }
            Some(903) => self.finish_negotiation(),
            Some(902) | Some(904..=907) => {
                let reason = msg.text().unwrap_or("authentication failed");
                warn!(reason, "SASL authentication failed");
                let mut actions = vec![RegAction::Report(format!("SASL failed: {reason}"))];
                actions.extend(self.finish_negotiation());
                actions
            }
            _ => Vec::new(),
        }
    }

    fn handle_cap(&mut self, msg: &MessageRef<'_>, caps: &mut CapFlags) -> Vec<RegAction> {
        let subcmd = msg.arg(1).unwrap_or("");
        let list = msg.text().unwrap_or("");

        match subcmd.to_ascii_uppercase().as_str() {
            "LS" => {
                if !self.offered.is_empty() {
                    self.offered.push(' ');
                }
                self.offered.push_str(list);

                // A `*` before the list marks a continued multiline reply.
                self.waiting_more_caps = msg.arg(2) == Some("*");
                if self.waiting_more_caps {
                    return Vec::new();
                }

                let want_sasl = self.identity.sasl.is_some();
                let wanted = intersect_offer(&self.offered, want_sasl);
                if wanted.is_empty() {
                    self.finish_negotiation()
                } else {
                    vec![RegAction::Send(format!("CAP REQ :{}", wanted.join(" ")))]
                }
            }
            "ACK" => {
                for cap in list.split_whitespace() {
                    let name = cap.trim_start_matches(['-', '~', '=']);
                    if !cap.starts_with('-') {
                        caps.set(name);
                    }
                }
                if caps.sasl && self.identity.sasl.is_some() {
                    self.phase = RegPhase::Authenticating;
                    vec![RegAction::Send("AUTHENTICATE PLAIN".to_string())]
                } else {
                    self.finish_negotiation()
                }
            }
            "NAK" => {
                debug!(rejected = list, "CAP REQ rejected");
                self.finish_negotiation()
            }
            _ => Vec::new(),
        }
    }

    fn handle_authenticate(&mut self, msg: &MessageRef<'_>) -> Vec<RegAction> {
        if msg.text() != Some("+") {
            return Vec::new();
        }
        match &self.identity.sasl {
            Some(creds) => {
                let payload = encode_plain(&creds.account, &creds.password);
                vec![RegAction::Send(format!("AUTHENTICATE {payload}"))]
            }
            None => self.finish_negotiation(),
        }
    }

    /// Close capability negotiation and wait for the welcome numeric.
    fn finish_negotiation(&mut self) -> Vec<RegAction> {
        self.phase = RegPhase::AwaitingWelcome;
        if self.cap_ended {
            return Vec::new();
        }
        self.cap_ended = true;
        vec![RegAction::Send("CAP END".to_string())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            nickname: "testbot".to_string(),
            username: "bot".to_string(),
            realname: "Test Bot".to_string(),
            password: None,
            sasl: None,
        }
    }

    fn sends(actions: &[RegAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                RegAction::Send(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    fn feed(machine: &mut RegistrationMachine, caps: &mut CapFlags, line: &str) -> Vec<RegAction> {
        let msg = MessageRef::parse(line).unwrap();
        machine.feed(&msg, caps)
    }

    #[test]
    fn start_sends_identity_and_cap_ls() {
        let mut machine = RegistrationMachine::new(identity());
        let actions = machine.start();
        assert_eq!(
            sends(&actions),
            vec!["CAP LS 302", "NICK testbot", "USER bot 0 * :Test Bot"]
        );
    }

    #[test]
    fn pass_precedes_everything() {
        let mut id = identity();
        id.password = Some("hunter2".to_string());
        let mut machine = RegistrationMachine::new(id);
        let actions = machine.start();
        assert_eq!(sends(&actions)[0], "PASS :hunter2");
    }

    #[test]
    fn no_recognized_caps_means_immediate_end() {
        let mut machine = RegistrationMachine::new(identity());
        let mut caps = CapFlags::default();
        let _ = machine.start();

        let actions = feed(&mut machine, &mut caps, ":server CAP * LS :batch echo-message");
        assert_eq!(sends(&actions), vec!["CAP END"]);

        let actions = feed(&mut machine, &mut caps, ":server 001 testbot :Welcome");
        assert!(actions.contains(&RegAction::Complete));
        assert!(machine.is_complete());
    }

    #[test]
    fn recognized_caps_are_requested_and_acked() {
        let mut machine = RegistrationMachine::new(identity());
        let mut caps = CapFlags::default();
        let _ = machine.start();

        let actions = feed(
            &mut machine,
            &mut caps,
            ":server CAP * LS :multi-prefix away-notify sasl",
        );
        assert_eq!(sends(&actions), vec!["CAP REQ :multi-prefix away-notify"]);

        let actions = feed(
            &mut machine,
            &mut caps,
            ":server CAP testbot ACK :multi-prefix away-notify",
        );
        assert!(caps.multi_prefix);
        assert!(caps.away_notify);
        assert_eq!(sends(&actions), vec!["CAP END"]);
    }

    #[test]
    fn multiline_cap_ls_accumulates() {
        let mut machine = RegistrationMachine::new(identity());
        let mut caps = CapFlags::default();
        let _ = machine.start();

        let actions = feed(&mut machine, &mut caps, ":server CAP * LS * :batch");
        assert!(actions.is_empty());
        let actions = feed(&mut machine, &mut caps, ":server CAP * LS :multi-prefix");
        assert_eq!(sends(&actions), vec!["CAP REQ :multi-prefix"]);
    }

    #[test]
    fn sasl_flow_runs_before_cap_end() {
        let mut id = identity();
        id.sasl = Some(SaslCredentials {
            account: "testbot".to_string(),
            password: "sesame".to_string(),
        });
        let mut machine = RegistrationMachine::new(id);
        let mut caps = CapFlags::default();
        let _ = machine.start();

        let actions = feed(&mut machine, &mut caps, ":server CAP * LS :sasl");
        assert_eq!(sends(&actions), vec!["CAP REQ :sasl"]);

        let actions = feed(&mut machine, &mut caps, ":server CAP testbot ACK :sasl");
        assert_eq!(sends(&actions), vec!["AUTHENTICATE PLAIN"]);

        let actions = feed(&mut machine, &mut caps, "AUTHENTICATE +");
        let lines = sends(&actions);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("AUTHENTICATE "));

        let actions = feed(&mut machine, &mut caps, ":server 903 testbot :SASL ok");
        assert_eq!(sends(&actions), vec!["CAP END"]);
    }

    #[test]
    fn sasl_failure_reports_and_continues() {
        let mut id = identity();
        id.sasl = Some(SaslCredentials {
            account: "testbot".to_string(),
            password: "wrong".to_string(),
        });
        let mut machine = RegistrationMachine::new(id);
        let mut caps = CapFlags::default();
        let _ = machine.start();
        let _ = feed(&mut machine, &mut caps, ":server CAP * LS :sasl");
        let _ = feed(&mut machine, &mut caps, ":server CAP testbot ACK :sasl");

        let actions = feed(
            &mut machine,
            &mut caps,
            ":server 904 testbot :SASL authentication failed",
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, RegAction::Report(r) if r.contains("SASL"))));
        assert_eq!(sends(&actions), vec!["CAP END"]);
    }

    #[test]
    fn nick_collision_appends_underscore() {
        let mut machine = RegistrationMachine::new(identity());
        let mut caps = CapFlags::default();
        let _ = machine.start();

        let actions = feed(
            &mut machine,
            &mut caps,
            ":server 433 * testbot :Nickname is already in use",
        );
        assert_eq!(sends(&actions), vec!["NICK testbot_"]);
        assert_eq!(machine.nick(), "testbot_");
    }

    #[test]
    fn server_without_cap_finishes_on_421() {
        let mut machine = RegistrationMachine::new(identity());
        let mut caps = CapFlags::default();
        let _ = machine.start();

        let actions = feed(&mut machine, &mut caps, ":server 421 testbot CAP :Unknown command");
        assert_eq!(sends(&actions), vec!["CAP END"]);
    }
}
