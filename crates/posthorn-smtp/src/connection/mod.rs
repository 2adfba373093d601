//! SMTP connection lifecycle management.
//!
//! [`SmtpConnection`] owns the transport/protocol pair, serializes connect
//! attempts through a single-flight lock, bounds every suspension point with
//! a timeout, and turns transport failures into typed errors after tearing
//! the connection down. Verb sequencing (EHLO, MAIL, RCPT, DATA, AUTH) is
//! layered on top of [`execute_command`](SmtpConnection::execute_command) by
//! callers.

mod protocol;
mod session;
mod stream;

pub use protocol::StreamProtocol;
pub use stream::SmtpStream;

use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, ProtocolVersion};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::{ConnectOptions, ConnectionConfig, Override};
use crate::error::{Error, Result};
use crate::tls;
use crate::types::{Reply, ReplyCode};

/// Recognized transport introspection keys.
///
/// A fixed, enumerated set; [`TransportInfoKey::from_key`] maps the string
/// forms and yields `None` for anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportInfoKey {
    /// Remote address (`"peername"`).
    PeerName,
    /// Raw socket descriptor (`"socket"`).
    Socket,
    /// Local address (`"sockname"`).
    SockName,
    /// Negotiated compression (`"compression"`); always absent with rustls.
    Compression,
    /// Negotiated cipher suite (`"cipher"`).
    Cipher,
    /// Server end-entity certificate (`"peercert"`).
    PeerCert,
    /// Active TLS client configuration (`"sslcontext"`).
    TlsConfig,
    /// Negotiated TLS protocol version (`"sslobject"`).
    TlsSession,
}

impl TransportInfoKey {
    /// Maps a string key to its enumerated form, `None` if unrecognized.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "peername" => Some(Self::PeerName),
            "socket" => Some(Self::Socket),
            "sockname" => Some(Self::SockName),
            "compression" => Some(Self::Compression),
            "cipher" => Some(Self::Cipher),
            "peercert" => Some(Self::PeerCert),
            "sslcontext" => Some(Self::TlsConfig),
            "sslobject" => Some(Self::TlsSession),
            _ => None,
        }
    }
}

/// A transport introspection value.
#[derive(Debug, Clone)]
pub enum TransportInfo {
    /// Remote address.
    Peer(SocketAddr),
    /// Local address.
    Local(SocketAddr),
    /// Raw socket descriptor.
    #[cfg(unix)]
    Socket(RawFd),
    /// Negotiated cipher suite name.
    Cipher(String),
    /// Server end-entity certificate.
    PeerCertificate(CertificateDer<'static>),
    /// Active TLS client configuration.
    TlsConfig(Arc<ClientConfig>),
    /// Negotiated TLS protocol version.
    TlsProtocol(ProtocolVersion),
}

struct State {
    config: ConnectionConfig,
    protocol: Option<StreamProtocol>,
}

struct Inner {
    state: Mutex<State>,
    /// Single-flight connect lock: one permit, acquired by `connect` and
    /// released only by `close`.
    connect_lock: Arc<Semaphore>,
    /// The permit of the connect attempt that last succeeded.
    connect_permit: std::sync::Mutex<Option<OwnedSemaphorePermit>>,
    /// Mirror of the connected state for lock-free reads.
    connected: AtomicBool,
    executor: Handle,
}

/// Manages connection and disconnection from an SMTP server.
///
/// Cloning is cheap and shares the underlying connection; concurrent connect
/// attempts on clones queue on the single-flight lock rather than racing.
///
/// Options provided to [`SmtpConnection::new`] or to
/// [`connect`](Self::connect) are saved: subsequent connects reuse them
/// unless new ones are supplied.
#[derive(Clone)]
pub struct SmtpConnection {
    inner: Arc<Inner>,
}

impl SmtpConnection {
    /// Creates a connection manager on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if mutually exclusive TLS options
    /// are supplied.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime; use
    /// [`with_executor`](Self::with_executor) to supply a handle explicitly.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::with_executor(config, Handle::current())
    }

    /// Creates a connection manager bound to an explicit runtime handle.
    ///
    /// The handle becomes part of the instance state; it is used to run the
    /// greeting wait as an independently cancellable task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if mutually exclusive TLS options
    /// are supplied.
    pub fn with_executor(config: ConnectionConfig, executor: Handle) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    config,
                    protocol: None,
                }),
                connect_lock: Arc::new(Semaphore::new(1)),
                connect_permit: std::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                executor,
            }),
        })
    }

    /// Connects to the server and waits for its greeting.
    ///
    /// Callers queue on the single-flight lock: a second connect while one
    /// is in flight (or while connected) suspends until [`close`](Self::close)
    /// releases the lock, then proceeds with its own overrides. Overrides are
    /// folded into the stored configuration; omitted fields keep their
    /// previous values.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] for mutually exclusive options or an empty
    ///   hostname.
    /// - [`Error::Connect`] if the transport cannot be opened or the greeting
    ///   is not 220.
    /// - [`Error::ConnectTimeout`] if the transport open or the greeting wait
    ///   exceeds its own timeout budget.
    ///
    /// On every failure the connection is torn down first, leaving the
    /// manager re-connectable.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Reply> {
        let permit = Arc::clone(&self.inner.connect_lock)
            .acquire_owned()
            .await
            .map_err(|_| Error::Protocol("connect lock closed".into()))?;

        let mut state = self.inner.state.lock().await;
        state.config.apply(options);
        state.config.validate()?;

        match self.open_connection(&mut state).await {
            Ok(greeting) => {
                *self
                    .inner
                    .connect_permit
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(permit);
                self.inner.connected.store(true, Ordering::SeqCst);
                Ok(greeting)
            }
            Err(err) => {
                self.teardown(&mut state).await;
                Err(err)
            }
        }
    }

    async fn open_connection(&self, state: &mut State) -> Result<Reply> {
        let hostname = state.config.hostname.clone();
        if hostname.is_empty() {
            return Err(Error::configuration("hostname must be set"));
        }
        let port = state.config.resolved_port();
        let timeout = state.config.timeout;

        let tls_config = if state.config.use_tls {
            Some(tls::build_client_config(
                state.config.tls_config.as_ref(),
                state.config.validate_certs,
                state.config.cert_bundle.as_deref(),
                state.config.client_cert.as_deref(),
                state.config.client_key.as_deref(),
            )?)
        } else {
            None
        };

        tracing::debug!(host = %hostname, port, tls = tls_config.is_some(), "opening transport");

        let opening = async {
            match tls_config {
                Some(config) => SmtpStream::connect_tls(&hostname, port, config).await,
                None => SmtpStream::connect_plain(&hostname, port).await,
            }
        };
        let stream = match bounded(timeout, opening).await {
            Some(Ok(stream)) => stream,
            Some(Err(err)) => {
                return Err(Error::Connect {
                    host: hostname,
                    port,
                    message: err.to_string(),
                });
            }
            None => {
                return Err(Error::ConnectTimeout(format!(
                    "timed out connecting to {hostname} on port {port}"
                )));
            }
        };

        // The greeting wait is its own abortable task so that its timeout is
        // an independent budget from the transport-open timeout above.
        let mut protocol = StreamProtocol::bind(stream);
        let mut greeting_task = self.inner.executor.spawn(async move {
            let reply = protocol.read_response(None).await;
            (protocol, reply)
        });

        let (protocol, greeting) = match bounded(timeout, &mut greeting_task).await {
            Some(Ok((protocol, Ok(greeting)))) => (protocol, greeting),
            Some(Ok((_, Err(err)))) => return Err(err),
            Some(Err(join_err)) => {
                return Err(Error::Protocol(format!("greeting wait failed: {join_err}")));
            }
            None => {
                // Aborting the task drops the half-open transport.
                greeting_task.abort();
                return Err(Error::ConnectTimeout(
                    "timed out waiting for server greeting".into(),
                ));
            }
        };

        if greeting.code != ReplyCode::SERVICE_READY {
            return Err(Error::Connect {
                host: hostname,
                port,
                message: greeting.to_string(),
            });
        }

        tracing::debug!(code = greeting.code.as_u16(), "connected");
        state.protocol = Some(protocol);
        Ok(greeting)
    }

    /// Executes a command and returns the server's reply.
    ///
    /// `timeout` falls back to the stored default when
    /// [`Override::Keep`] is passed; [`Override::Clear`] waits indefinitely.
    ///
    /// A detected disconnection or timeout tears the connection down before
    /// the error surfaces. A 421 reply (server shutting down) closes the
    /// connection proactively but is still returned to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without attempting any I/O when no
    /// live transport is present, or the protocol-level error otherwise.
    pub async fn execute_command(
        &self,
        segments: &[&[u8]],
        timeout: Override<Duration>,
    ) -> Result<Reply> {
        let mut state = self.inner.state.lock().await;
        let limit = match timeout {
            Override::Keep => state.config.timeout,
            Override::Clear => None,
            Override::Set(limit) => Some(limit),
        };

        let Some(protocol) = state.protocol.as_mut() else {
            return Err(Error::NotConnected);
        };

        match protocol.execute_command(segments, limit).await {
            Ok(reply) => {
                if reply.code == ReplyCode::SERVICE_UNAVAILABLE {
                    tracing::debug!("server announced shutdown, closing connection");
                    self.teardown(&mut state).await;
                }
                Ok(reply)
            }
            Err(err @ (Error::Disconnected(_) | Error::Timeout(_) | Error::Io(_))) => {
                tracing::warn!(%err, "connection lost during command");
                self.teardown(&mut state).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Closes the connection.
    ///
    /// Idempotent and infallible: shuts the transport down if one is open,
    /// releases the single-flight lock, and clears the transport/protocol
    /// pair, leaving the manager re-connectable.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        self.teardown(&mut state).await;
    }

    /// Returns true if a transport is present and not shutting down.
    ///
    /// Pure read; no side effects.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Returns the local host name presented to the server, resolving and
    /// caching it on first use.
    pub async fn source_address(&self) -> String {
        let mut state = self.inner.state.lock().await;
        state.config.source_address().to_string()
    }

    /// Reads an introspection value from the live transport.
    ///
    /// Keys whose value is absent on the current transport (for example
    /// `Cipher` on a plaintext connection, or `Compression` always) yield
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if no live transport is present.
    pub async fn transport_info(&self, key: TransportInfoKey) -> Result<Option<TransportInfo>> {
        let state = self.inner.state.lock().await;
        let Some(protocol) = state.protocol.as_ref() else {
            return Err(Error::NotConnected);
        };
        let stream = protocol.stream();

        let info = match key {
            TransportInfoKey::PeerName => stream.peer_addr().ok().map(TransportInfo::Peer),
            TransportInfoKey::SockName => stream.local_addr().ok().map(TransportInfo::Local),
            TransportInfoKey::Socket => {
                #[cfg(unix)]
                {
                    Some(TransportInfo::Socket(stream.raw_fd()))
                }
                #[cfg(not(unix))]
                {
                    None
                }
            }
            TransportInfoKey::Compression => None,
            TransportInfoKey::Cipher => stream.cipher_suite().map(TransportInfo::Cipher),
            TransportInfoKey::PeerCert => {
                stream.peer_certificate().map(TransportInfo::PeerCertificate)
            }
            TransportInfoKey::TlsConfig => stream.tls_config().map(TransportInfo::TlsConfig),
            TransportInfoKey::TlsSession => {
                stream.protocol_version().map(TransportInfo::TlsProtocol)
            }
        };
        Ok(info)
    }

    /// Drops the transport/protocol pair and releases the single-flight
    /// lock. Shutdown errors are logged and swallowed.
    async fn teardown(&self, state: &mut State) {
        if let Some(mut protocol) = state.protocol.take() {
            if let Err(err) = protocol.stream_mut().shutdown().await {
                tracing::debug!(%err, "error shutting down transport");
            }
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        *self
            .inner
            .connect_permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for SmtpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Awaits `future` under an optional deadline; `None` means it elapsed.
async fn bounded<F>(limit: Option<Duration>, future: F) -> Option<F::Output>
where
    F: Future,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::config::{ConnectOptions, ConnectionConfig};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Spawns a scripted server: sends `greeting` on accept, then answers
    /// each incoming command line with the next entry of `replies`. Accepts
    /// any number of connections, each running the same script.
    async fn spawn_server(
        greeting: Option<&'static str>,
        replies: &'static [&'static str],
        close_after: bool,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    if let Some(greeting) = greeting {
                        if reader
                            .get_mut()
                            .write_all(greeting.as_bytes())
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    for reply in replies {
                        let mut command = String::new();
                        if reader.read_line(&mut command).await.unwrap_or(0) == 0 {
                            return;
                        }
                        if reader
                            .get_mut()
                            .write_all(reply.as_bytes())
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    if close_after {
                        // Drain one more command so the client's write lands
                        // before the socket drops.
                        let mut command = String::new();
                        let _ = reader.read_line(&mut command).await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                });
            }
        });
        addr
    }

    fn manager(addr: SocketAddr) -> SmtpConnection {
        let mut config = ConnectionConfig::new("127.0.0.1");
        config.port = Some(addr.port());
        config.timeout = Some(Duration::from_secs(2));
        SmtpConnection::new(config).unwrap()
    }

    #[tokio::test]
    async fn connect_returns_validated_greeting() {
        let addr = spawn_server(Some("220 mail.test ESMTP ready\r\n"), &[], false).await;
        let conn = manager(addr);

        let greeting = conn.connect(ConnectOptions::new()).await.unwrap();
        assert_eq!(greeting.code, ReplyCode::SERVICE_READY);
        assert!(conn.is_connected());

        conn.close().await;
        assert!(!conn.is_connected());
        // Idempotent.
        conn.close().await;
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn non_ready_greeting_fails_and_leaves_reconnectable_state() {
        let bad = spawn_server(Some("554 go away\r\n"), &[], false).await;
        let good = spawn_server(Some("220 mail.test ready\r\n"), &[], false).await;
        let conn = manager(bad);

        let err = conn.connect(ConnectOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
        assert!(err.to_string().contains("554"));
        assert!(!conn.is_connected());

        // The failed attempt released the lock and cleared the transport.
        conn.connect(ConnectOptions::new().port(good.port()))
            .await
            .unwrap();
        assert!(conn.is_connected());
        conn.close().await;
    }

    #[tokio::test]
    async fn greeting_timeout_tears_down() {
        let silent = spawn_server(None, &[], false).await;
        let good = spawn_server(Some("220 mail.test ready\r\n"), &[], false).await;
        let conn = manager(silent);

        let err = conn
            .connect(ConnectOptions::new().timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout(_)));
        assert!(err.to_string().contains("greeting"));
        assert!(!conn.is_connected());

        conn.connect(
            ConnectOptions::new()
                .port(good.port())
                .timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert!(conn.is_connected());
        conn.close().await;
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = manager(addr);
        let err = conn.connect(ConnectOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn mutually_exclusive_options_fail_at_connect() {
        let addr = spawn_server(Some("220 ready\r\n"), &[], false).await;
        let conn = manager(addr);

        let tls_config = crate::tls::build_client_config(None, true, None, None, None).unwrap();
        let mut options = ConnectOptions::new()
            .tls_config(tls_config)
            .client_cert("client.pem");
        let err = conn.connect(options.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!conn.is_connected());

        // Clearing one side of the conflict makes the stored state valid
        // again, and the failed attempt did not leave the lock held.
        options.tls_config = Override::Clear;
        options.client_cert = Override::Clear;
        conn.connect(options).await.unwrap();
        assert!(conn.is_connected());
        conn.close().await;
    }

    #[tokio::test]
    async fn execute_command_requires_connection() {
        let addr = spawn_server(Some("220 ready\r\n"), &[], false).await;
        let conn = manager(addr);

        let err = conn
            .execute_command(&[b"NOOP"], Override::Keep)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn execute_command_round_trip() {
        let addr = spawn_server(Some("220 ready\r\n"), &["250 OK\r\n"], false).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        let reply = conn
            .execute_command(&[b"NOOP"], Override::Keep)
            .await
            .unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert!(conn.is_connected());
        conn.close().await;
    }

    #[tokio::test]
    async fn service_unavailable_reply_closes_but_is_returned() {
        let addr = spawn_server(Some("220 ready\r\n"), &["421 shutting down\r\n"], false).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        let reply = conn
            .execute_command(&[b"NOOP"], Override::Keep)
            .await
            .unwrap();
        assert_eq!(reply.code, ReplyCode::SERVICE_UNAVAILABLE);
        assert!(!conn.is_connected());

        // The proactive close left the manager re-connectable.
        conn.connect(ConnectOptions::new()).await.unwrap();
        assert!(conn.is_connected());
        conn.close().await;
    }

    #[tokio::test]
    async fn command_timeout_tears_down() {
        let addr = spawn_server(Some("220 ready\r\n"), &[], false).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        let err = conn
            .execute_command(&[b"NOOP"], Override::Set(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn disconnect_mid_command_tears_down() {
        let addr = spawn_server(Some("220 ready\r\n"), &[], true).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        let err = conn
            .execute_command(&[b"NOOP"], Override::Keep)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn concurrent_connects_queue_on_the_single_flight_lock() {
        let addr = spawn_server(Some("220 ready\r\n"), &[], false).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        let second = conn.clone();
        let waiter =
            tokio::spawn(async move { second.connect(ConnectOptions::new()).await });

        // The second caller suspends on the lock while the first connection
        // is live; only close releases it.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!waiter.is_finished());

        conn.close().await;
        let greeting = waiter.await.unwrap().unwrap();
        assert_eq!(greeting.code, ReplyCode::SERVICE_READY);
        assert!(conn.is_connected());
        conn.close().await;
    }

    #[tokio::test]
    async fn transport_info_enumerates_fixed_keys() {
        let addr = spawn_server(Some("220 ready\r\n"), &[], false).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        match conn
            .transport_info(TransportInfoKey::PeerName)
            .await
            .unwrap()
        {
            Some(TransportInfo::Peer(peer)) => assert_eq!(peer, addr),
            other => panic!("unexpected peername info: {other:?}"),
        }
        assert!(
            conn.transport_info(TransportInfoKey::SockName)
                .await
                .unwrap()
                .is_some()
        );
        // Plaintext connection: TLS-related values are absent, not errors.
        assert!(
            conn.transport_info(TransportInfoKey::Cipher)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            conn.transport_info(TransportInfoKey::Compression)
                .await
                .unwrap()
                .is_none()
        );

        conn.close().await;
        assert!(matches!(
            conn.transport_info(TransportInfoKey::PeerName).await,
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn transport_info_key_string_mapping() {
        assert_eq!(
            TransportInfoKey::from_key("peername"),
            Some(TransportInfoKey::PeerName)
        );
        assert_eq!(
            TransportInfoKey::from_key("sslobject"),
            Some(TransportInfoKey::TlsSession)
        );
        assert_eq!(TransportInfoKey::from_key("bogus"), None);
    }

    #[tokio::test]
    async fn source_address_is_memoized() {
        let addr = spawn_server(Some("220 ready\r\n"), &[], false).await;
        let conn = manager(addr);
        let first = conn.source_address().await;
        assert!(!first.is_empty());
        assert_eq!(conn.source_address().await, first);
    }
}
