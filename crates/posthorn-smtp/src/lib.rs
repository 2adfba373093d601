//! # posthorn-smtp
//!
//! The connection core of an async SMTP client: transports, TLS, timeouts,
//! and session lifecycle, built on Tokio and rustls.
//!
//! ## Features
//!
//! - **Managed lifecycle**: connect, greeting validation, command execution,
//!   and close behind one handle; concurrent connects queue on a
//!   single-flight lock instead of racing
//! - **TLS support**: implicit TLS (port 465) with webpki roots, extra CA
//!   bundles, mutual TLS, or a caller-supplied `rustls::ClientConfig`
//! - **Timeout discipline**: every suspension point is bounded by a
//!   configurable timeout, with per-call overrides that can also disable it
//! - **Scoped sessions**: a guard combinator that connects on entry and
//!   quits or closes on exit depending on how the body ended
//!
//! ## Quick Start
//!
//! ```ignore
//! use posthorn_smtp::{ConnectOptions, ConnectionConfig, Override, SmtpConnection};
//!
//! #[tokio::main]
//! async fn main() -> posthorn_smtp::Result<()> {
//!     let conn = SmtpConnection::new(ConnectionConfig::new("smtp.example.com"))?;
//!
//!     conn.session(ConnectOptions::new(), |conn| async move {
//!         let reply = conn.execute_command(&[b"NOOP"], Override::Keep).await?;
//!         println!("server said: {reply}");
//!         Ok(())
//!     })
//!     .await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: stored connection parameters and per-call overrides
//! - [`connection`]: the connection manager, transport, and protocol endpoint
//! - [`parser`]: reply parsing
//! - [`tls`]: TLS client-configuration assembly
//! - [`types`]: core reply types

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
mod error;
pub mod parser;
pub mod tls;
pub mod types;

pub use config::{
    ConnectOptions, ConnectionConfig, DEFAULT_TIMEOUT, Override, SMTP_PORT, SMTP_STARTTLS_PORT,
    SMTP_TLS_PORT,
};
pub use connection::{
    SmtpConnection, SmtpStream, StreamProtocol, TransportInfo, TransportInfoKey,
};
pub use error::{Error, Result};
pub use types::{Reply, ReplyCode};
