//! # ircore
//!
//! An IRC client protocol engine: line framing, zero-copy message
//! parsing, table-driven dispatch, CAP/ISUPPORT negotiation, CTCP, and
//! channel state tracking.
//!
//! The protocol core is sans-IO: a [`Session`] holds all state for one
//! network, handlers mutate it, and outgoing lines accumulate in an
//! outbox. The `tokio` feature adds the [`conn`] driver that owns the
//! socket and pumps the core.
//!
//! ## Embedding
//!
//! The engine talks to the rest of a client through one trait,
//! [`ClientUi`]: it asks the embedder to create and destroy conversation
//! contexts, append display text to them, and observe status changes.
//! Everything else is inward API on [`Session`] and [`Handle`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use ircore::{
//!     conn::Connection, dispatch::Dispatcher, session::{ServerConfig, Session},
//!     state::Identity, NetworkId,
//! };
//!
//! # async fn connect(ui: Arc<dyn ircore::ClientUi>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig {
//!     host: "irc.libera.chat".to_string(),
//!     port: 6667,
//!     tls: false,
//!     identity: Identity {
//!         nickname: "ferris".to_string(),
//!         username: "ferris".to_string(),
//!         realname: "Ferris".to_string(),
//!         password: None,
//!         sasl: None,
//!     },
//! };
//! let session = Session::new(NetworkId(1), config, ui);
//! let (conn, handle) = Connection::new(session, Dispatcher::with_defaults(), None);
//! tokio::spawn(conn.run());
//! handle.send_raw("JOIN #rust");
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod caps;
pub mod casemap;
pub mod chan;
pub mod claims;
pub mod ctcp;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod isupport;
pub mod line;
pub mod message;
pub mod registry;
pub mod sasl;
pub mod session;
pub mod state;
pub mod util;

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub mod conn;

pub use self::caps::{CapFlags, Capability};
pub use self::casemap::Casemapping;
pub use self::chan::{Conversation, ConversationId, ConversationKind, Member, NetworkId};
pub use self::claims::{ClaimQueue, ResponseClaim};
pub use self::dispatch::{Dispatcher, Handler};
pub use self::error::{HandlerError, MessageParseError, ProtocolError};
pub use self::isupport::ServerInfo;
pub use self::line::{LineBuffer, MAX_LINE_LEN};
pub use self::message::{MessageRef, MAX_PARAMS};
pub use self::registry::Registry;
pub use self::sasl::SaslCredentials;
pub use self::session::{ClientUi, DisplayQueue, ServerConfig, Session};
pub use self::state::{ConnStatus, Identity, RegistrationMachine};

#[cfg(feature = "tokio")]
pub use self::conn::{
    CertDecision, CertFailure, CertPolicy, ClientCommand, ConnectError, Connection, Handle,
    RejectAll, TlsOptions,
};
