//! Response reader / command sender bound to one transport.
//!
//! This is the collaborator the connection manager delegates to: it waits
//! for complete (possibly multi-line) replies and sends framed commands,
//! both cancellable by timeout. Verb sequencing lives above this layer.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::Reply;

use super::SmtpStream;

/// Protocol endpoint bound to a single [`SmtpStream`].
#[derive(Debug)]
pub struct StreamProtocol {
    stream: SmtpStream,
}

impl StreamProtocol {
    /// Binds a protocol endpoint to an established transport.
    #[must_use]
    pub const fn bind(stream: SmtpStream) -> Self {
        Self { stream }
    }

    /// Returns the underlying transport, for introspection.
    #[must_use]
    pub const fn stream(&self) -> &SmtpStream {
        &self.stream
    }

    /// Returns the underlying transport mutably.
    pub const fn stream_mut(&mut self) -> &mut SmtpStream {
        &mut self.stream
    }

    /// Releases the transport, consuming the protocol.
    #[must_use]
    pub fn into_stream(self) -> SmtpStream {
        self.stream
    }

    /// Waits for the next complete server reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if `timeout` elapses first,
    /// [`Error::Disconnected`] if the server closes the connection, or
    /// [`Error::Protocol`] if the reply is malformed.
    pub async fn read_response(&mut self, timeout: Option<Duration>) -> Result<Reply> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.read_response_inner())
                .await
                .map_err(|_| Error::Timeout("timed out waiting for server response".into()))?,
            None => self.read_response_inner().await,
        }
    }

    /// Sends a command and waits for the resulting reply.
    ///
    /// The segments are joined with single spaces and terminated with CRLF.
    ///
    /// # Errors
    ///
    /// As [`read_response`](Self::read_response), plus any write error.
    pub async fn execute_command(
        &mut self,
        segments: &[&[u8]],
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.execute_command_inner(segments))
                .await
                .map_err(|_| Error::Timeout("timed out executing command".into()))?,
            None => self.execute_command_inner(segments).await,
        }
    }

    async fn read_response_inner(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.stream.read_line().await?;
            if line.is_empty() {
                continue;
            }
            let last = is_last_reply_line(&line);
            lines.push(line);
            if last {
                break;
            }
        }

        let reply = parse_reply(&lines)?;
        tracing::trace!(code = reply.code.as_u16(), "server reply");
        Ok(reply)
    }

    async fn execute_command_inner(&mut self, segments: &[&[u8]]) -> Result<Reply> {
        let mut wire = Vec::new();
        for (index, segment) in segments.iter().enumerate() {
            if index > 0 {
                wire.push(b' ');
            }
            wire.extend_from_slice(segment);
        }
        wire.extend_from_slice(b"\r\n");

        self.stream.write_all(&wire).await?;
        self.read_response_inner().await
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
    use crate::types::ReplyCode;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn connected_protocol(server_script: &'static str) -> StreamProtocol {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut command = String::new();
            reader.read_line(&mut command).await.unwrap();
            reader
                .get_mut()
                .write_all(server_script.as_bytes())
                .await
                .unwrap();
        });

        let stream = SmtpStream::connect_plain("127.0.0.1", addr.port())
            .await
            .unwrap();
        StreamProtocol::bind(stream)
    }

    #[tokio::test]
    async fn command_round_trip() {
        let mut protocol = connected_protocol("250 OK\r\n").await;
        let reply = protocol
            .execute_command(&[b"NOOP"], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
    }

    #[tokio::test]
    async fn multi_line_reply_is_assembled() {
        let mut protocol =
            connected_protocol("250-mail.test\r\n250-PIPELINING\r\n250 OK\r\n").await;
        let reply = protocol
            .execute_command(&[b"EHLO", b"client.test"], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.message, vec!["mail.test", "PIPELINING", "OK"]);
    }

    #[tokio::test]
    async fn into_stream_hands_the_transport_back() {
        // The STARTTLS flow: acknowledge the upgrade, release the transport
        // for the TLS handshake, then bind a fresh endpoint around it.
        let mut protocol = connected_protocol("220 go ahead\r\n").await;
        let reply = protocol
            .execute_command(&[b"STARTTLS"], Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.code, ReplyCode::SERVICE_READY);

        let stream = protocol.into_stream();
        assert!(!stream.is_tls());
        let protocol = StreamProtocol::bind(stream);
        assert!(protocol.stream().peer_addr().is_ok());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let stream = SmtpStream::connect_plain("127.0.0.1", addr.port())
            .await
            .unwrap();
        let mut protocol = StreamProtocol::bind(stream);
        let err = protocol
            .read_response(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        hold.abort();
    }

    #[tokio::test]
    async fn server_close_is_a_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let stream = SmtpStream::connect_plain("127.0.0.1", addr.port())
            .await
            .unwrap();
        let mut protocol = StreamProtocol::bind(stream);
        let err = protocol
            .read_response(Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }
}
