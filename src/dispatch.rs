//! Message routing to named-command and numeric-reply handlers.
//!
//! Numeric replies index a fixed 0–999 table; named commands look up a
//! case-insensitive registry. CTCP frames extracted from PRIVMSG/NOTICE
//! payloads route through two further tables, one per direction. All
//! tables are built once at startup and read-mostly afterwards; explicit
//! add/remove stays available for embedders with custom commands.

use tracing::warn;

use crate::casemap::Casemapping;
use crate::ctcp::{self, CtcpDirection, CtcpFrame, CtcpHandler};
use crate::error::HandlerError;
use crate::handlers;
use crate::message::MessageRef;
use crate::registry::Registry;
use crate::session::Session;

/// Handler for one named command or numeric reply.
pub type Handler = fn(&Dispatcher, &mut Session, &MessageRef<'_>) -> Result<(), HandlerError>;

/// Routing tables for one engine instance.
pub struct Dispatcher {
    commands: Registry<Handler>,
    numerics: Box<[Option<Handler>; 1000]>,
    ctcp_requests: Registry<CtcpHandler>,
    ctcp_responses: Registry<CtcpHandler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Dispatcher {
    /// Empty tables. Command and CTCP names are protocol-ASCII.
    pub fn new() -> Self {
        Dispatcher {
            commands: Registry::new(Casemapping::Ascii),
            numerics: Box::new([None; 1000]),
            ctcp_requests: Registry::new(Casemapping::Ascii),
            ctcp_responses: Registry::new(Casemapping::Ascii),
        }
    }

    /// Tables populated with the built-in protocol handlers.
    pub fn with_defaults() -> Self {
        let mut d = Self::new();
        handlers::install(&mut d);
        d
    }

    /// Register (or replace) a named-command handler.
    pub fn register_command(&mut self, name: &str, handler: Handler) {
        self.commands.insert(name, handler);
    }

    /// Remove a named-command handler.
    pub fn unregister_command(&mut self, name: &str) -> Option<Handler> {
        self.commands.remove(name)
    }

    /// Register (or replace) a numeric-reply handler.
    ///
    /// Numerics outside 0–999 cannot appear on the wire and are ignored.
    pub fn register_numeric(&mut self, numeric: u16, handler: Handler) {
        if let Some(slot) = self.numerics.get_mut(numeric as usize) {
            *slot = Some(handler);
        }
    }

    /// Register (or replace) a CTCP type handler for one direction.
    pub fn register_ctcp(&mut self, direction: CtcpDirection, kind: &str, handler: CtcpHandler) {
        match direction {
            CtcpDirection::Request => self.ctcp_requests.insert(kind, handler),
            CtcpDirection::Response => self.ctcp_responses.insert(kind, handler),
        };
    }

    /// Route one parsed message.
    ///
    /// Unknown commands and numerics produce a diagnostic dump to the root
    /// conversation without altering state. A handler's missing-parameter
    /// error is recoverable (dump and continue); only
    /// [`HandlerError::Fatal`] propagates.
    pub fn dispatch(
        &self,
        session: &mut Session,
        msg: &MessageRef<'_>,
    ) -> Result<(), HandlerError> {
        let handler = match msg.numeric() {
            Some(n) => self.numerics[n as usize],
            None => self.commands.get(msg.command).copied(),
        };

        let Some(handler) = handler else {
            session.dump_message(msg);
            return Ok(());
        };

        match handler(self, session, msg) {
            Ok(()) => Ok(()),
            Err(HandlerError::NeedMoreParams { expected, got }) => {
                warn!(
                    command = msg.command,
                    expected, got, "message missing parameters, dumped"
                );
                session.dump_message(msg);
                Ok(())
            }
            Err(fatal) => Err(fatal),
        }
    }

    /// Route an extracted CTCP frame. Unknown types dump a diagnostic.
    pub fn dispatch_ctcp(
        &self,
        session: &mut Session,
        direction: CtcpDirection,
        sender: Option<&str>,
        target: &str,
        frame: CtcpFrame<'_>,
    ) -> Result<(), HandlerError> {
        let table = match direction {
            CtcpDirection::Request => &self.ctcp_requests,
            CtcpDirection::Response => &self.ctcp_responses,
        };
        match table.get(frame.kind) {
            Some(handler) => handler(session, sender, target, frame.args),
            None => {
                let from = sender.unwrap_or("?");
                session.display_root(&format!(
                    "unknown CTCP {} from {from}: {}",
                    frame.kind, frame.args
                ));
                Ok(())
            }
        }
    }

    /// Divert a PRIVMSG/NOTICE payload to the CTCP tables if it carries a
    /// frame. Returns true if the payload was consumed as CTCP.
    pub fn maybe_ctcp(
        &self,
        session: &mut Session,
        direction: CtcpDirection,
        sender: Option<&str>,
        target: &str,
        payload: &str,
    ) -> Result<bool, HandlerError> {
        match ctcp::extract(payload) {
            Some(frame) => {
                self.dispatch_ctcp(session, direction, sender, target, frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_session;

    fn noop(_: &Dispatcher, _: &mut Session, _: &MessageRef<'_>) -> Result<(), HandlerError> {
        Ok(())
    }

    fn fatal(_: &Dispatcher, _: &mut Session, _: &MessageRef<'_>) -> Result<(), HandlerError> {
        Err(HandlerError::Fatal("boom".to_string()))
    }

    fn short(_: &Dispatcher, _: &mut Session, msg: &MessageRef<'_>) -> Result<(), HandlerError> {
        Err(HandlerError::NeedMoreParams {
            expected: 2,
            got: msg.args.len(),
        })
    }

    #[test]
    fn unknown_command_dumps_to_root() {
        let (mut session, ui) = test_session();
        let d = Dispatcher::new();
        let msg = MessageRef::parse(":srv BLORT a b :c").unwrap();
        d.dispatch(&mut session, &msg).unwrap();
        session.flush_display();

        let displayed = ui.displayed.lock().unwrap();
        assert_eq!(displayed.len(), 1);
        assert!(displayed[0].1.contains("BLORT"));
    }

    #[test]
    fn unknown_numeric_dumps_to_root() {
        let (mut session, ui) = test_session();
        let d = Dispatcher::new();
        let msg = MessageRef::parse(":srv 999 me :odd").unwrap();
        d.dispatch(&mut session, &msg).unwrap();
        session.flush_display();
        assert_eq!(ui.displayed.lock().unwrap().len(), 1);
    }

    #[test]
    fn command_lookup_is_case_insensitive() {
        let (mut session, ui) = test_session();
        let mut d = Dispatcher::new();
        d.register_command("PING", noop);
        let msg = MessageRef::parse("ping :x").unwrap();
        d.dispatch(&mut session, &msg).unwrap();
        session.flush_display();
        // Handled, so no diagnostic dump.
        assert!(ui.displayed.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_params_is_recoverable() {
        let (mut session, ui) = test_session();
        let mut d = Dispatcher::new();
        d.register_command("KICK", short);
        let msg = MessageRef::parse("KICK #chan").unwrap();
        assert!(d.dispatch(&mut session, &msg).is_ok());
        session.flush_display();
        assert_eq!(ui.displayed.lock().unwrap().len(), 1);
    }

    #[test]
    fn fatal_errors_propagate() {
        let (mut session, _ui) = test_session();
        let mut d = Dispatcher::new();
        d.register_command("ERROR", fatal);
        let msg = MessageRef::parse("ERROR :closing").unwrap();
        assert!(d.dispatch(&mut session, &msg).is_err());
    }

    #[test]
    fn numeric_range_guard() {
        let mut d = Dispatcher::new();
        // Out-of-range numerics are ignored rather than panicking.
        d.register_numeric(1000, noop);
    }
}
