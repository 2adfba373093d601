//! Connection configuration and per-call overrides.
//!
//! Options can be provided both when the connection is created and on each
//! [`connect`](crate::SmtpConnection::connect) call. In both cases they are
//! saved: later connects reuse the stored values unless new ones are given.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;

use crate::error::{Error, Result};

/// Default SMTP port for plaintext connections.
pub const SMTP_PORT: u16 = 25;
/// Default SMTP port when connecting directly over TLS.
pub const SMTP_TLS_PORT: u16 = 465;
/// Conventional submission port for STARTTLS upgrades.
pub const SMTP_STARTTLS_PORT: u16 = 587;
/// Fallback timeout for connect, greeting wait, and command execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Three-state override for a stored option.
///
/// Distinguishes "caller passed nothing" from "caller explicitly cleared the
/// value": [`Override::Keep`] leaves the stored value untouched,
/// [`Override::Clear`] resets it to unset, and [`Override::Set`] replaces it.
#[derive(Debug, Clone)]
pub enum Override<T> {
    /// Keep the previously stored value.
    Keep,
    /// Reset the stored value to unset.
    Clear,
    /// Replace the stored value.
    Set(T),
}

// Manual impl: a derive would bound `T: Default` for no reason.
impl<T> Default for Override<T> {
    fn default() -> Self {
        Self::Keep
    }
}

impl<T> Override<T> {
    /// Applies this override to a stored slot.
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Clear => *slot = None,
            Self::Set(value) => *slot = Some(value),
        }
    }
}

/// Stored connection parameters.
///
/// `port` and `source_address` are resolved lazily; the TLS fields feed the
/// TLS builder when `use_tls` is set. A pre-built `tls_config` and an
/// explicit `client_cert` are mutually exclusive.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server name (or IP) to connect to.
    pub hostname: String,
    /// Server port; resolved to 465 (TLS) or 25 when unset.
    pub port: Option<u16>,
    /// Default timeout for all operations; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Make the initial connection over TLS.
    pub use_tls: bool,
    /// Verify server certificates and hostnames.
    pub validate_certs: bool,
    /// Path to a client certificate, for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// Path to the client key; may be embedded in `client_cert` instead.
    pub client_key: Option<PathBuf>,
    /// Pre-built TLS configuration; mutually exclusive with `client_cert`.
    pub tls_config: Option<Arc<ClientConfig>>,
    /// Additional CA trust anchor file.
    pub cert_bundle: Option<PathBuf>,
    /// Local host name presented to the server; resolved lazily when unset.
    source_address: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: None,
            timeout: Some(DEFAULT_TIMEOUT),
            use_tls: false,
            validate_certs: true,
            client_cert: None,
            client_key: None,
            tls_config: None,
            cert_bundle: None,
            source_address: None,
        }
    }
}

impl ConnectionConfig {
    /// Creates a configuration for the given server with default options.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    /// Checks the mutual-exclusion invariant between a pre-built TLS
    /// configuration and an explicit client certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if both are set.
    pub fn validate(&self) -> Result<()> {
        if self.tls_config.is_some() && self.client_cert.is_some() {
            return Err(Error::configuration(
                "either a TLS configuration or a client certificate may be provided, not both",
            ));
        }
        Ok(())
    }

    /// Returns the effective port: the stored value, or 465 when connecting
    /// over TLS, or 25 otherwise.
    #[must_use]
    pub const fn resolved_port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.use_tls => SMTP_TLS_PORT,
            None => SMTP_PORT,
        }
    }

    /// Returns the local host name presented to the server.
    ///
    /// Resolved from the system on first use and cached; the lookup is never
    /// repeated once a value is stored.
    pub fn source_address(&mut self) -> &str {
        self.source_address.get_or_insert_with(|| {
            whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string())
        })
    }

    /// Stores an explicit source address, preempting lazy resolution.
    pub fn set_source_address(&mut self, source_address: impl Into<String>) {
        self.source_address = Some(source_address.into());
    }

    /// Folds connect-call overrides into the stored values. Fields the caller
    /// did not supply keep their previous values.
    pub(crate) fn apply(&mut self, options: ConnectOptions) {
        if let Some(hostname) = options.hostname {
            self.hostname = hostname;
        }
        if let Some(port) = options.port {
            self.port = Some(port);
        }
        if let Some(use_tls) = options.use_tls {
            self.use_tls = use_tls;
        }
        if let Some(validate_certs) = options.validate_certs {
            self.validate_certs = validate_certs;
        }
        options.timeout.apply(&mut self.timeout);
        options.source_address.apply(&mut self.source_address);
        options.client_cert.apply(&mut self.client_cert);
        options.client_key.apply(&mut self.client_key);
        options.tls_config.apply(&mut self.tls_config);
        options.cert_bundle.apply(&mut self.cert_bundle);
    }
}

/// Per-call overrides for [`connect`](crate::SmtpConnection::connect).
///
/// Every field defaults to "keep the stored value". Fields where an explicit
/// clear is meaningful use [`Override`]; the rest use `Option`, where `None`
/// can only mean keep.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Replacement server name.
    pub hostname: Option<String>,
    /// Replacement server port.
    pub port: Option<u16>,
    /// Replacement TLS-on-connect flag.
    pub use_tls: Option<bool>,
    /// Replacement certificate-validation flag.
    pub validate_certs: Option<bool>,
    /// Timeout override; `Clear` disables the timeout entirely.
    pub timeout: Override<Duration>,
    /// Source address override; `Clear` re-enables lazy resolution.
    pub source_address: Override<String>,
    /// Client certificate override.
    pub client_cert: Override<PathBuf>,
    /// Client key override.
    pub client_key: Override<PathBuf>,
    /// Pre-built TLS configuration override.
    pub tls_config: Override<Arc<ClientConfig>>,
    /// CA bundle override.
    pub cert_bundle: Override<PathBuf>,
}

impl ConnectOptions {
    /// Creates an empty set of overrides (everything kept).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the server name.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Overrides the server port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Overrides the TLS-on-connect flag.
    #[must_use]
    pub const fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = Some(use_tls);
        self
    }

    /// Overrides the certificate-validation flag.
    #[must_use]
    pub const fn validate_certs(mut self, validate_certs: bool) -> Self {
        self.validate_certs = Some(validate_certs);
        self
    }

    /// Overrides the default timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Override::Set(timeout);
        self
    }

    /// Disables the default timeout: operations wait indefinitely.
    #[must_use]
    pub const fn no_timeout(mut self) -> Self {
        self.timeout = Override::Clear;
        self
    }

    /// Overrides the source address presented to the server.
    #[must_use]
    pub fn source_address(mut self, source_address: impl Into<String>) -> Self {
        self.source_address = Override::Set(source_address.into());
        self
    }

    /// Overrides the client certificate path.
    #[must_use]
    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert = Override::Set(path.into());
        self
    }

    /// Overrides the client key path.
    #[must_use]
    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key = Override::Set(path.into());
        self
    }

    /// Overrides the pre-built TLS configuration.
    #[must_use]
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Override::Set(config);
        self
    }

    /// Overrides the CA bundle path.
    #[must_use]
    pub fn cert_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_bundle = Override::Set(path.into());
        self
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
    fn defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, None);
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
        assert!(!config.use_tls);
        assert!(config.validate_certs);
    }

    #[test]
    fn port_resolution_follows_tls_flag() {
        let mut config = ConnectionConfig::new("mail.test");
        assert_eq!(config.resolved_port(), SMTP_PORT);

        config.use_tls = true;
        assert_eq!(config.resolved_port(), SMTP_TLS_PORT);

        config.port = Some(2525);
        assert_eq!(config.resolved_port(), 2525);
    }

    #[test]
    fn overrides_keep_unset_fields() {
        let mut config = ConnectionConfig::new("mail.test");
        config.port = Some(2525);

        config.apply(ConnectOptions::new().hostname("other.test"));
        assert_eq!(config.hostname, "other.test");
        assert_eq!(config.port, Some(2525));
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn clear_is_distinct_from_keep() {
        let mut config = ConnectionConfig::new("mail.test");

        config.apply(ConnectOptions::new().timeout(Duration::from_secs(5)));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));

        config.apply(ConnectOptions::new());
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));

        config.apply(ConnectOptions::new().no_timeout());
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn mutual_exclusion_is_rejected() {
        let mut config = ConnectionConfig::new("mail.test");
        config.client_cert = Some(PathBuf::from("client.pem"));
        assert!(config.validate().is_ok());

        config.tls_config =
            Some(crate::tls::build_client_config(None, true, None, None, None).unwrap());
        assert!(config.validate().is_err());

        config.client_cert = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn source_address_is_resolved_once() {
        let mut config = ConnectionConfig::new("mail.test");
        let first = config.source_address().to_string();
        assert!(!first.is_empty());
        assert_eq!(config.source_address(), first);

        config.apply(ConnectOptions::new().source_address("client.test"));
        assert_eq!(config.source_address(), "client.test");
    }
}
