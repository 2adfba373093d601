//! Error types for SMTP connection management.

use std::io;

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the connection core.
///
/// Every variant that implies a potentially inconsistent transport state is
/// raised only after the connection has been torn down, so the owning
/// [`SmtpConnection`](crate::SmtpConnection) is always left re-connectable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Mutually exclusive options supplied, or hostname/port unresolved.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The transport could not be opened, or the greeting was not 220.
    #[error("error connecting to {host} on port {port}: {message}")]
    Connect {
        /// Target server name.
        host: String,
        /// Target server port.
        port: u16,
        /// Underlying failure text or greeting reply.
        message: String,
    },

    /// Transport open or greeting wait exceeded its timeout budget.
    #[error("connect timed out: {0}")]
    ConnectTimeout(String),

    /// An operation requiring a live transport was invoked without one.
    #[error("not connected to an SMTP server")]
    NotConnected,

    /// The server closed the connection mid-operation.
    #[error("server disconnected: {0}")]
    Disconnected(String),

    /// A command or read exceeded its timeout budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Server returned an error reply.
    #[error("SMTP error {code}: {message}")]
    Smtp {
        /// Reply code (e.g., 550).
        code: u16,
        /// Reply message from the server.
        message: String,
    },

    /// Malformed server reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an SMTP error from a reply code and message.
    #[must_use]
    pub fn smtp_error(code: u16, message: impl Into<String>) -> Self {
        Self::Smtp {
            code,
            message: message.into(),
        }
    }

    /// Returns true for errors that imply the transport is gone or unusable.
    ///
    /// The session scope guard force-closes instead of attempting a graceful
    /// quit when the body failed with one of these.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout(_)
                | Self::NotConnected
                | Self::Disconnected(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }

    /// Returns true if this error is a timeout expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_) | Self::Timeout(_))
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

    #[test]
    fn connect_error_display() {
        let err = Error::Connect {
            host: "mail.test".to_string(),
            port: 25,
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "error connecting to mail.test on port 25: connection refused"
        );
    }

    #[test]
    fn smtp_error_display() {
        let err = Error::smtp_error(554, "transaction failed");
        assert_eq!(err.to_string(), "SMTP error 554: transaction failed");
    }

    #[test]
    fn connection_error_classification() {
        assert!(Error::NotConnected.is_connection_error());
        assert!(Error::Disconnected("eof".into()).is_connection_error());
        assert!(Error::ConnectTimeout("greeting".into()).is_connection_error());
        assert!(Error::Timeout("command".into()).is_connection_error());
        assert!(!Error::smtp_error(550, "no such user").is_connection_error());
        assert!(!Error::configuration("bad options").is_connection_error());
    }

    #[test]
    fn timeout_classification() {
        assert!(Error::ConnectTimeout("connect".into()).is_timeout());
        assert!(Error::Timeout("read".into()).is_timeout());
        assert!(!Error::NotConnected.is_timeout());
    }
}
