//! SMTP reply types.
//!
//! A [`Reply`] is an immutable value: it can be cloned freely and shared
//! across suspension points without affecting connection state.

/// A complete (possibly multi-line) reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code (e.g., 220).
    pub code: ReplyCode,
    /// Reply text, one entry per line with continuation markers stripped.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    pub const fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns the full reply text, lines joined with newlines.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message.join(" "))
    }
}

/// Three-digit SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// 220 Service ready — the expected greeting code.
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel.
    pub const CLOSING: Self = Self(221);
    /// 250 Requested action okay, completed.
    pub const OK: Self = Self(250);
    /// 421 Service not available, closing transmission channel.
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 554 Transaction failed.
    pub const TRANSACTION_FAILED: Self = Self(554);

    /// Creates a reply code from its numeric value.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true for success codes (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true for transient errors (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true for permanent errors (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
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
    fn code_classification() {
        assert!(ReplyCode::SERVICE_READY.is_success());
        assert!(ReplyCode::CLOSING.is_success());
        assert!(ReplyCode::SERVICE_UNAVAILABLE.is_transient());
        assert!(ReplyCode::TRANSACTION_FAILED.is_permanent());
        assert!(!ReplyCode::OK.is_transient());
        assert!(!ReplyCode::OK.is_permanent());
    }

    #[test]
    fn reply_display_includes_code_and_text() {
        let reply = Reply::new(
            ReplyCode::TRANSACTION_FAILED,
            vec!["no SMTP service here".to_string()],
        );
        assert_eq!(reply.to_string(), "554 no SMTP service here");
    }

    #[test]
    fn message_text_joins_lines() {
        let reply = Reply::new(
            ReplyCode::SERVICE_READY,
            vec!["mail.test ESMTP".to_string(), "ready".to_string()],
        );
        assert_eq!(reply.message_text(), "mail.test ESMTP\nready");
        assert!(reply.is_success());
    }

    #[test]
    fn code_ordering_and_value() {
        assert_eq!(ReplyCode::new(220), ReplyCode::SERVICE_READY);
        assert_eq!(ReplyCode::OK.as_u16(), 250);
        assert!(ReplyCode::CLOSING < ReplyCode::OK);
    }
}
