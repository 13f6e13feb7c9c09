//! Async connection driver: DNS resolution, TCP/TLS transport, and the
//! per-connection event loop.
//!
//! The protocol core is sans-IO; everything that touches a socket lives
//! here, behind the `tokio` feature. A connection is driven by
//! [`Connection::run`], which owns the [`Session`] for its lifetime and
//! drains its outbox and display queue around each socket event. Commands
//! from the embedder arrive over an unbounded channel via [`Handle`].

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::chan::ConversationId;
use crate::dispatch::Dispatcher;
use crate::error::{HandlerError, ProtocolError};
use crate::line::LineBuffer;
use crate::message::MessageRef;
use crate::session::Session;
use crate::state::ConnStatus;

/// Errors terminating a connection attempt or an established connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Host name resolution failed or produced no addresses.
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// Every resolved address refused the connection.
    #[error("connect to {host} failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    /// TLS setup or handshake failed (a rejected certificate lands here).
    #[error("TLS failure: {0}")]
    Tls(#[from] rustls::Error),

    /// Socket I/O on the established connection failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The server sent an ERROR command or otherwise ended the session.
    #[error("connection terminated: {0}")]
    Terminated(String),
}

/// A certificate chain the trust store rejected, presented for a policy
/// decision.
#[derive(Debug)]
pub struct CertFailure {
    /// Host the certificate was presented for.
    pub host: String,
    /// The verification error as rustls reported it.
    pub reason: String,
}

/// Outcome of a certificate policy consultation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertDecision {
    /// Proceed with the handshake despite the failure.
    Accept,
    /// Abort the handshake.
    Reject,
}

/// Embedder policy for certificates the trust store rejects.
///
/// Consulted from inside the TLS handshake, on the connection's task. The
/// handshake pauses until the policy returns, so an implementation may
/// block on user input, but it must not wait on this connection's own
/// event loop.
pub trait CertPolicy: Send + Sync {
    fn decide(&self, failure: &CertFailure) -> CertDecision;
}

/// The safe default policy: every failure aborts the handshake.
#[derive(Debug, Default)]
pub struct RejectAll;

impl CertPolicy for RejectAll {
    fn decide(&self, _failure: &CertFailure) -> CertDecision {
        CertDecision::Reject
    }
}

/// TLS configuration for one connection.
pub struct TlsOptions {
    roots: RootCertStore,
    policy: Arc<dyn CertPolicy>,
}

impl TlsOptions {
    /// Verify against an explicit root store, rejecting all failures.
    pub fn new(roots: RootCertStore) -> Self {
        TlsOptions {
            roots,
            policy: Arc::new(RejectAll),
        }
    }

    /// Verify against the platform's native trust store.
    ///
    /// Roots that fail to load are skipped with a warning, matching how
    /// most clients treat a partially broken system store.
    pub fn system_roots() -> Self {
        let mut roots = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for err in &certs.errors {
            warn!("error loading native certs: {err}");
        }
        for cert in certs.certs {
            if let Err(e) = roots.add(cert) {
                warn!("failed to add root cert: {e}");
            }
        }
        TlsOptions::new(roots)
    }

    /// Replace the failure policy.
    pub fn with_policy(mut self, policy: Arc<dyn CertPolicy>) -> Self {
        self.policy = policy;
        self
    }
}

/// Certificate verifier that defers trust-store failures to a
/// [`CertPolicy`].
///
/// Delegates to the standard WebPKI verifier; only when that rejects the
/// chain does the policy get a say. Signature checks are never overridden.
#[derive(Debug)]
struct PolicyVerifier {
    inner: Arc<WebPkiServerVerifier>,
    policy: Arc<dyn CertPolicy>,
    host: String,
}

impl std::fmt::Debug for dyn CertPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertPolicy")
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(err) => {
                let failure = CertFailure {
                    host: self.host.clone(),
                    reason: err.to_string(),
                };
                match self.policy.decide(&failure) {
                    CertDecision::Accept => {
                        warn!(host = %failure.host, reason = %failure.reason,
                            "certificate failure overridden by policy");
                        Ok(ServerCertVerified::assertion())
                    }
                    CertDecision::Reject => Err(err),
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Commands the embedder can issue against a live connection.
pub enum ClientCommand {
    /// Queue a raw protocol line.
    SendRaw(String),
    /// Send a PRIVMSG (with local echo).
    Privmsg { target: String, text: String },
    /// Send a NOTICE.
    Notice { target: String, text: String },
    /// Send a CTCP request inside a PRIVMSG.
    Ctcp {
        target: String,
        kind: String,
        args: String,
    },
    /// Record that the command just issued expects replies directed at
    /// a conversation.
    ClaimResponse {
        target: ConversationId,
        payload: Box<dyn Any + Send>,
    },
    /// Close the connection, optionally with a QUIT reason.
    Disconnect(Option<String>),
}

impl std::fmt::Debug for ClientCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendRaw(line) => f.debug_tuple("SendRaw").field(line).finish(),
            Self::Privmsg { target, .. } => f
                .debug_struct("Privmsg")
                .field("target", target)
                .finish_non_exhaustive(),
            Self::Notice { target, .. } => f
                .debug_struct("Notice")
                .field("target", target)
                .finish_non_exhaustive(),
            Self::Ctcp { target, kind, .. } => f
                .debug_struct("Ctcp")
                .field("target", target)
                .field("kind", kind)
                .finish_non_exhaustive(),
            Self::ClaimResponse { target, .. } => f
                .debug_struct("ClaimResponse")
                .field("target", target)
                .finish_non_exhaustive(),
            Self::Disconnect(reason) => f.debug_tuple("Disconnect").field(reason).finish(),
        }
    }
}

/// Cloneable command channel into a running [`Connection`].
#[derive(Clone, Debug)]
pub struct Handle {
    tx: mpsc::UnboundedSender<ClientCommand>,
    abort: Arc<AtomicBool>,
}

impl Handle {
    /// Queue a raw protocol line. Silently dropped once the connection
    /// has ended.
    pub fn send_raw(&self, line: &str) {
        let _ = self.tx.send(ClientCommand::SendRaw(line.to_string()));
    }

    /// Send a PRIVMSG through the connection.
    pub fn send_privmsg(&self, target: &str, text: &str) {
        let _ = self.tx.send(ClientCommand::Privmsg {
            target: target.to_string(),
            text: text.to_string(),
        });
    }

    /// Send a NOTICE through the connection.
    pub fn send_notice(&self, target: &str, text: &str) {
        let _ = self.tx.send(ClientCommand::Notice {
            target: target.to_string(),
            text: text.to_string(),
        });
    }

    /// Send a CTCP request through the connection.
    pub fn send_ctcp(&self, target: &str, kind: &str, args: &str) {
        let _ = self.tx.send(ClientCommand::Ctcp {
            target: target.to_string(),
            kind: kind.to_string(),
            args: args.to_string(),
        });
    }

    /// Record that the command just issued expects replies directed at
    /// `target`. Issue this right after the raw command so the claim
    /// order matches the command order.
    pub fn claim_response(&self, target: ConversationId, payload: Box<dyn Any + Send>) {
        let _ = self
            .tx
            .send(ClientCommand::ClaimResponse { target, payload });
    }

    /// Close the connection. Takes effect at any phase, including while
    /// the resolver is still running.
    pub fn disconnect(&self, reason: Option<&str>) {
        self.abort.store(true, Ordering::SeqCst);
        let _ = self
            .tx
            .send(ClientCommand::Disconnect(reason.map(str::to_string)));
    }
}

/// Byte stream the event loop reads and writes, TCP or TLS.
trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// One connection's driver: owns the session and the socket.
pub struct Connection {
    session: Session,
    dispatcher: Dispatcher,
    tls: Option<TlsOptions>,
    rx: mpsc::UnboundedReceiver<ClientCommand>,
    abort: Arc<AtomicBool>,
}

impl Connection {
    /// Pair a session with a command handle. The connection does nothing
    /// until [`run`](Connection::run) is awaited.
    ///
    /// `tls` overrides the TLS setup when the session's config asks for
    /// TLS; with `None` the platform trust store and the [`RejectAll`]
    /// policy are used.
    pub fn new(session: Session, dispatcher: Dispatcher, tls: Option<TlsOptions>) -> (Self, Handle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));
        let handle = Handle {
            tx,
            abort: Arc::clone(&abort),
        };
        let conn = Connection {
            session,
            dispatcher,
            tls,
            rx,
            abort,
        };
        (conn, handle)
    }

    /// Drive the connection to completion: resolve, connect, register,
    /// then pump messages until disconnect.
    ///
    /// On return the session has been through
    /// [`handle_disconnect`](Session::handle_disconnect) regardless of how
    /// the connection ended.
    pub async fn run(mut self) -> Result<(), ConnectError> {
        let result = self.run_inner().await;
        if let Err(err) = &result {
            self.session.display_root(&format!("disconnected: {err}"));
        }
        self.session.handle_disconnect();
        result
    }

    async fn run_inner(&mut self) -> Result<(), ConnectError> {
        let host = self.session.config.host.clone();
        let port = self.session.config.port;

        // Resolution runs on its own task so a disconnect issued mid-lookup
        // does not have to wait for the resolver to give up.
        self.session.set_status(ConnStatus::Resolving);
        self.session.flush_display();
        let addrs = tokio::select! {
            addrs = spawn_resolver(host.clone(), port, Arc::clone(&self.abort)) => addrs?,
            Some(ClientCommand::Disconnect(_)) = recv_disconnect(&mut self.rx) => {
                return Ok(());
            }
        };

        self.session.set_status(ConnStatus::Connecting);
        self.session.flush_display();
        let tcp = tokio::select! {
            tcp = connect_any(&host, &addrs) => tcp?,
            Some(ClientCommand::Disconnect(_)) = recv_disconnect(&mut self.rx) => {
                return Ok(());
            }
        };

        if let Err(e) = enable_keepalive(&tcp) {
            warn!("failed to enable TCP keepalive: {e}");
        }

        let mut stream: Box<dyn AsyncStream> = if self.session.config.tls {
            let options = self.tls.take().unwrap_or_else(TlsOptions::system_roots);
            self.session.set_status(ConnStatus::TlsHandshake);
            Box::new(tls_handshake(tcp, &host, options).await?)
        } else {
            Box::new(tcp)
        };
        info!(host = %host, port, "connection established");

        self.session.begin_registration();
        self.event_loop(&mut stream).await
    }

    async fn event_loop(&mut self, stream: &mut Box<dyn AsyncStream>) -> Result<(), ConnectError> {
        let mut framer = LineBuffer::new();
        loop {
            while let Some(line) = self.session.take_outgoing() {
                debug!(line = %line, "send");
                stream.write_all(line.as_bytes()).await?;
                stream.write_all(b"\r\n").await?;
            }
            stream.flush().await?;
            self.session.flush_display();

            tokio::select! {
                read = stream.read_buf(framer.space()) => {
                    if read? == 0 {
                        self.session.display_root("connection closed by server");
                        return Ok(());
                    }
                    self.drain_lines(&mut framer)?;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(ClientCommand::SendRaw(line)) => self.session.send_raw(&line),
                    Some(ClientCommand::Privmsg { target, text }) => {
                        self.session.send_privmsg(&target, &text);
                    }
                    Some(ClientCommand::Notice { target, text }) => {
                        self.session.send_notice(&target, &text);
                    }
                    Some(ClientCommand::Ctcp { target, kind, args }) => {
                        self.session.send_ctcp(&target, &kind, &args);
                    }
                    Some(ClientCommand::ClaimResponse { target, payload }) => {
                        self.session.claim_response(target, payload);
                    }
                    Some(ClientCommand::Disconnect(reason)) => {
                        let quit = match reason {
                            Some(reason) => format!("QUIT :{reason}"),
                            None => "QUIT".to_string(),
                        };
                        stream.write_all(quit.as_bytes()).await?;
                        stream.write_all(b"\r\n").await?;
                        stream.flush().await?;
                        return Ok(());
                    }
                    // Every handle is gone; nothing can drive this
                    // connection any more.
                    None => return Ok(()),
                },
            }
        }
    }

    fn drain_lines(&mut self, framer: &mut LineBuffer) -> Result<(), ConnectError> {
        loop {
            match framer.next_line() {
                Ok(Some(line)) => {
                    let line = String::from_utf8_lossy(line).into_owned();
                    debug!(line = %line, "recv");
                    match MessageRef::parse(&line) {
                        Ok(msg) => match self.dispatcher.dispatch(&mut self.session, &msg) {
                            Ok(()) => {}
                            Err(HandlerError::Fatal(reason)) => {
                                return Err(ConnectError::Terminated(reason));
                            }
                            Err(err) => return Err(ConnectError::Terminated(err.to_string())),
                        },
                        Err(err) => {
                            warn!(%err, line = %line, "dropping malformed line");
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(ProtocolError::MessageTooLong(len)) => {
                    // A framing fault desynchronizes the stream; drop the
                    // buffer and resynchronize at the next terminator.
                    warn!(len, "oversized line, discarding receive buffer");
                    self.session
                        .display_root("received an oversized message, discarded");
                    framer.reset();
                    return Ok(());
                }
                Err(err) => return Err(ConnectError::Terminated(err.to_string())),
            }
        }
    }
}

/// Receive only disconnects, dropping anything queued before the socket
/// exists.
async fn recv_disconnect(
    rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
) -> Option<ClientCommand> {
    loop {
        match rx.recv().await? {
            cmd @ ClientCommand::Disconnect(_) => return Some(cmd),
            other => debug!(?other, "command before connection established, dropped"),
        }
    }
}

/// Resolve on a separate task, handing the addresses back only if the
/// connection has not been aborted in the meantime.
async fn spawn_resolver(
    host: String,
    port: u16,
    abort: Arc<AtomicBool>,
) -> Result<Vec<SocketAddr>, ConnectError> {
    let (tx, rx) = oneshot::channel();
    let lookup_host_name = host.clone();
    tokio::spawn(async move {
        let result = lookup_host((lookup_host_name.as_str(), port)).await;
        if abort.load(Ordering::SeqCst) {
            debug!(host = %lookup_host_name, "resolution finished after abort, discarded");
            return;
        }
        let _ = tx.send(result.map(|addrs| addrs.collect::<Vec<_>>()));
    });

    match rx.await {
        Ok(Ok(addrs)) if !addrs.is_empty() => Ok(addrs),
        Ok(Ok(_)) => Err(ConnectError::Resolve {
            host,
            reason: "no addresses".to_string(),
        }),
        Ok(Err(err)) => Err(ConnectError::Resolve {
            host,
            reason: err.to_string(),
        }),
        // Resolver task dropped the sender: aborted.
        Err(_) => Err(ConnectError::Resolve {
            host,
            reason: "aborted".to_string(),
        }),
    }
}

/// Try each resolved address in order, returning the first stream.
async fn connect_any(host: &str, addrs: &[SocketAddr]) -> Result<TcpStream, ConnectError> {
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses");
    for addr in addrs {
        debug!(%addr, "attempting connection");
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                warn!(%addr, %err, "connection attempt failed");
                last_err = err;
            }
        }
    }
    Err(ConnectError::Connect {
        host: host.to_string(),
        source: last_err,
    })
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));
    sock.set_tcp_keepalive(&keepalive)
}

async fn tls_handshake(
    tcp: TcpStream,
    host: &str,
    options: TlsOptions,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let inner = WebPkiServerVerifier::builder(Arc::new(options.roots))
        .build()
        .map_err(|e| rustls::Error::General(e.to_string()))?;
    let verifier = PolicyVerifier {
        inner,
        policy: options.policy,
        host: host.to_string(),
    };
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|e| rustls::Error::General(e.to_string()))?;
    Ok(connector.connect(server_name, tcp).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_all_rejects() {
        let failure = CertFailure {
            host: "irc.example.net".to_string(),
            reason: "self-signed".to_string(),
        };
        assert_eq!(RejectAll.decide(&failure), CertDecision::Reject);
    }

    #[test]
    fn handle_survives_dropped_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Handle {
            tx,
            abort: Arc::new(AtomicBool::new(false)),
        };
        drop(rx);
        // Sends into a closed channel are silently dropped.
        handle.send_raw("PING :x");
        handle.disconnect(Some("bye"));
        assert!(handle.abort.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handle_commands_reach_the_session() {
        let (session, _ui) = crate::session::test_support::test_session();
        let (mut conn, handle) = Connection::new(session, Dispatcher::new(), None);

        handle.send_raw("WHOIS alice");
        handle.claim_response(ConversationId(42), Box::new(()));
        handle.send_notice("alice", "hi");
        handle.send_ctcp("alice", "VERSION", "");
        handle.disconnect(Some("bye"));

        let (client, mut server) = tokio::io::duplex(4096);
        let mut stream: Box<dyn AsyncStream> = Box::new(client);
        conn.event_loop(&mut stream).await.unwrap();
        drop(stream);

        assert_eq!(
            conn.session.claims.route_pending(),
            Some(ConversationId(42))
        );

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        let wire = String::from_utf8(wire).unwrap();
        assert!(wire.contains("WHOIS alice\r\n"));
        assert!(wire.contains("NOTICE alice :hi\r\n"));
        assert!(wire.contains("PRIVMSG alice :\u{1}VERSION\u{1}\r\n"));
        assert!(wire.ends_with("QUIT :bye\r\n"));
    }
}
