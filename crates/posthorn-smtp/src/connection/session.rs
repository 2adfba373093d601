//! Scoped session entry/exit around a connection.
//!
//! [`SmtpConnection::session`] is the guard combinator: it connects on entry
//! if needed, runs the caller's body, and on exit either closes hard (after
//! connection-class failures) or says goodbye politely with QUIT. Cleanup
//! never masks the body's outcome.

use std::time::Duration;

use crate::config::{ConnectOptions, Override};
use crate::error::Result;
use crate::types::Reply;

use super::SmtpConnection;

impl SmtpConnection {
    /// Sends QUIT and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the error from sending QUIT; the connection is closed only
    /// after a reply was received.
    pub async fn quit(&self, timeout: Override<Duration>) -> Result<Reply> {
        let reply = self.execute_command(&[b"QUIT"], timeout).await?;
        self.close().await;
        Ok(reply)
    }

    /// Runs `body` inside a connected session.
    ///
    /// Connects first (with `options`) unless already connected. On the way
    /// out, a connection-class error from the body or a connection that is
    /// already gone leads to a hard close; any other outcome ends with QUIT,
    /// falling back to a hard close if the goodbye itself fails. Cleanup
    /// errors are swallowed so the body's own result always surfaces.
    ///
    /// # Errors
    ///
    /// Returns the connect error if entry fails, or whatever `body` returns.
    pub async fn session<F, Fut, T>(&self, options: ConnectOptions, body: F) -> Result<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_connected() {
            self.connect(options).await?;
        }

        let outcome = body(self.clone()).await;

        match &outcome {
            Err(err) if err.is_connection_error() => self.close().await,
            _ if !self.is_connected() => self.close().await,
            _ => {
                if let Err(err) = self.quit(Override::Keep).await {
                    tracing::debug!(%err, "QUIT failed, closing connection");
                    self.close().await;
                }
            }
        }
        outcome
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
    use crate::config::ConnectionConfig;
    use crate::error::Error;
    use crate::types::ReplyCode;
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn spawn_server(replies: &'static [&'static str]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    if reader
                        .get_mut()
                        .write_all(b"220 mail.test ready\r\n")
                        .await
                        .is_err()
                    {
                        return;
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
    async fn session_connects_runs_body_and_quits() {
        let addr = spawn_server(&["250 OK\r\n", "221 bye\r\n"]).await;
        let conn = manager(addr);

        let value = conn
            .session(ConnectOptions::new(), |conn| async move {
                assert!(conn.is_connected());
                let reply = conn.execute_command(&[b"NOOP"], Override::Keep).await?;
                assert_eq!(reply.code, ReplyCode::OK);
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn session_reuses_an_existing_connection() {
        let addr = spawn_server(&["250 OK\r\n", "221 bye\r\n"]).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        // No reconnect on entry: the already-open transport answers NOOP.
        conn.session(ConnectOptions::new(), |conn| async move {
            let reply = conn.execute_command(&[b"NOOP"], Override::Keep).await?;
            assert_eq!(reply.code, ReplyCode::OK);
            Ok(())
        })
        .await
        .unwrap();

        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn connection_error_in_body_closes_without_quit() {
        let addr = spawn_server(&[]).await;
        let conn = manager(addr);

        let err = conn
            .session(ConnectOptions::new(), |_conn| async move {
                Err::<(), _>(Error::Disconnected("simulated drop".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Disconnected(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn non_connection_error_still_gets_a_goodbye() {
        let addr = spawn_server(&["221 bye\r\n"]).await;
        let conn = manager(addr);

        let err = conn
            .session(ConnectOptions::new(), |_conn| async move {
                Err::<(), _>(Error::smtp_error(550, "mailbox unavailable"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Smtp { code: 550, .. }));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_on_entry_surfaces() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = manager(addr);
        let err = conn
            .session(ConnectOptions::new(), |_conn| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn quit_says_goodbye_and_closes() {
        let addr = spawn_server(&["221 mail.test closing\r\n"]).await;
        let conn = manager(addr);
        conn.connect(ConnectOptions::new()).await.unwrap();

        let reply = conn.quit(Override::Keep).await.unwrap();
        assert_eq!(reply.code, ReplyCode::CLOSING);
        assert!(!conn.is_connected());
    }
}
