//! Low-level SMTP transport: plain TCP or TLS over TCP.

use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ProtocolVersion};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

/// The live network channel, plaintext or TLS-encrypted.
///
/// Exclusively owned by the connection manager (through the protocol it is
/// bound to) and dropped on every close.
#[derive(Debug)]
pub enum SmtpStream {
    /// Plain TCP connection.
    Plain(BufReader<TcpStream>),
    /// TLS-encrypted connection, with the configuration it was built from.
    Tls {
        /// The encrypted stream (boxed to reduce enum size).
        stream: Box<BufReader<TlsStream<TcpStream>>>,
        /// The client configuration used for the handshake.
        config: Arc<ClientConfig>,
    },
}

impl SmtpStream {
    /// Opens a plaintext connection to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect_plain(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::Plain(BufReader::new(stream)))
    }

    /// Opens a TLS connection to `host:port` using `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the TLS handshake fails.
    pub async fn connect_tls(host: &str, port: u16, config: Arc<ClientConfig>) -> Result<Self> {
        let tcp = TcpStream::connect((host, port)).await?;
        let connector = TlsConnector::from(Arc::clone(&config));
        let stream = connector.connect(server_name(host)?, tcp).await?;
        Ok(Self::Tls {
            stream: Box::new(BufReader::new(stream)),
            config,
        })
    }

    /// Upgrades an open plaintext connection to TLS in place (STARTTLS).
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already encrypted or the handshake
    /// fails.
    pub async fn upgrade_to_tls(self, host: &str, config: Arc<ClientConfig>) -> Result<Self> {
        let tcp = match self {
            Self::Plain(reader) => reader.into_inner(),
            Self::Tls { .. } => {
                return Err(Error::Protocol("connection is already using TLS".into()));
            }
        };
        let connector = TlsConnector::from(Arc::clone(&config));
        let stream = connector.connect(server_name(host)?, tcp).await?;
        Ok(Self::Tls {
            stream: Box::new(BufReader::new(stream)),
            config,
        })
    }

    /// Reads one line, stripped of its trailing CRLF.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] on end of stream, or the underlying
    /// I/O error.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = match self {
            Self::Plain(reader) => reader.read_line(&mut line).await?,
            Self::Tls { stream, .. } => stream.read_line(&mut line).await?,
        };
        if read == 0 {
            return Err(Error::Disconnected("connection closed by server".into()));
        }
        Ok(line.trim_end().to_string())
    }

    /// Writes and flushes raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(reader) => {
                reader.get_mut().write_all(data).await?;
                reader.get_mut().flush().await?;
            }
            Self::Tls { stream, .. } => {
                stream.get_mut().write_all(data).await?;
                stream.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    /// Shuts the transport down, flushing TLS close-notify where relevant.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Plain(reader) => reader.get_mut().shutdown().await?,
            Self::Tls { stream, .. } => stream.get_mut().shutdown().await?,
        }
        Ok(())
    }

    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Returns the remote address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is gone.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp().peer_addr()?)
    }

    /// Returns the local address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp().local_addr()?)
    }

    /// Returns the raw socket descriptor.
    #[cfg(unix)]
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }

    /// Returns the TLS configuration the handshake was built from.
    #[must_use]
    pub fn tls_config(&self) -> Option<Arc<ClientConfig>> {
        match self {
            Self::Plain(_) => None,
            Self::Tls { config, .. } => Some(Arc::clone(config)),
        }
    }

    /// Returns the negotiated cipher suite name.
    #[must_use]
    pub fn cipher_suite(&self) -> Option<String> {
        self.tls_connection()
            .and_then(|conn| conn.negotiated_cipher_suite())
            .map(|suite| format!("{:?}", suite.suite()))
    }

    /// Returns the negotiated TLS protocol version.
    #[must_use]
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.tls_connection().and_then(|conn| conn.protocol_version())
    }

    /// Returns the server's end-entity certificate.
    #[must_use]
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.tls_connection()
            .and_then(|conn| conn.peer_certificates())
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(reader) => reader.get_ref(),
            Self::Tls { stream, .. } => stream.get_ref().get_ref().0,
        }
    }

    fn tls_connection(&self) -> Option<&rustls::ClientConnection> {
        match self {
            Self::Plain(_) => None,
            Self::Tls { stream, .. } => Some(stream.get_ref().get_ref().1),
        }
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::configuration(format!("invalid TLS server name: {host:?}")))
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
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn plain_connect_exposes_addresses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = SmtpStream::connect_plain("127.0.0.1", addr.port())
            .await
            .unwrap();
        accept.await.unwrap();

        assert!(!stream.is_tls());
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(stream.local_addr().unwrap().ip(), addr.ip());
        assert!(stream.tls_config().is_none());
        assert!(stream.cipher_suite().is_none());
        assert!(stream.peer_certificate().is_none());
    }

    #[tokio::test]
    async fn read_line_strips_crlf_and_detects_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 mail.test ready\r\n").await.unwrap();
        });

        let mut stream = SmtpStream::connect_plain("127.0.0.1", addr.port())
            .await
            .unwrap();
        assert_eq!(stream.read_line().await.unwrap(), "220 mail.test ready");
        assert!(matches!(
            stream.read_line().await,
            Err(Error::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn write_all_reaches_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 6];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = SmtpStream::connect_plain("127.0.0.1", addr.port())
            .await
            .unwrap();
        stream.write_all(b"NOOP\r\n").await.unwrap();
        assert_eq!(server.await.unwrap(), b"NOOP\r\n");
    }
}
