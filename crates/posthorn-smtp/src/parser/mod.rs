//! Minimal SMTP reply parser backing the protocol endpoint.
//!
//! Replies are one or more lines of the form `CODE-text` (continuation) or
//! `CODE text` / bare `CODE` (final line). Full response-text validation is
//! out of scope here; only the code and line structure are interpreted.

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Assembles a [`Reply`] from the raw lines of a server response.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the lines do not form a valid reply.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let first = lines
        .first()
        .ok_or_else(|| Error::Protocol("empty reply".into()))?;

    let code_digits = first
        .get(..3)
        .ok_or_else(|| Error::Protocol(format!("reply too short: {first:?}")))?;
    let code = code_digits
        .parse::<u16>()
        .map_err(|_| Error::Protocol(format!("invalid reply code: {code_digits:?}")))?;

    let mut message = Vec::with_capacity(lines.len());
    for line in lines {
        match line.len() {
            0..=2 => return Err(Error::Protocol(format!("malformed reply line: {line:?}"))),
            3 => message.push(String::new()),
            // Skip the code and the "-"/" " separator. The separator must be
            // a whole ASCII byte; a multi-byte character there is malformed,
            // and `get` rejects it instead of panicking mid-character.
            _ => match line.get(4..) {
                Some(text) => message.push(text.to_string()),
                None => {
                    return Err(Error::Protocol(format!("malformed reply line: {line:?}")));
                }
            },
        }
    }

    Ok(Reply::new(ReplyCode::new(code), message))
}

/// Returns true if `line` terminates a reply.
///
/// Continuation lines carry `-` in the fourth column; a space (or a bare
/// three-digit code) marks the last line.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    line.as_bytes().get(3).is_none_or(|&sep| sep != b'-')
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

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn single_line_reply() {
        let reply = parse_reply(&lines(&["220 mail.test ESMTP ready"])).unwrap();
        assert_eq!(reply.code, ReplyCode::SERVICE_READY);
        assert_eq!(reply.message, vec!["mail.test ESMTP ready"]);
    }

    #[test]
    fn multi_line_reply_joins_continuations() {
        let reply = parse_reply(&lines(&["250-mail.test", "250-PIPELINING", "250 OK"])).unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.message, vec!["mail.test", "PIPELINING", "OK"]);
    }

    #[test]
    fn bare_code_line() {
        let reply = parse_reply(&lines(&["250"])).unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.message, vec![String::new()]);
    }

    #[test]
    fn rejects_empty_and_short_replies() {
        assert!(parse_reply(&[]).is_err());
        assert!(parse_reply(&lines(&["25"])).is_err());
        assert!(parse_reply(&lines(&["abc ok"])).is_err());
    }

    #[test]
    fn multibyte_separator_is_malformed_not_fatal() {
        // 0xC3 at byte 3 puts byte 4 inside the character.
        let err = parse_reply(&lines(&["220\u{e9} ready"])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn multibyte_reply_text_is_preserved() {
        let reply = parse_reply(&lines(&["250 caf\u{e9} accepted"])).unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.message, vec!["caf\u{e9} accepted"]);
    }

    #[test]
    fn last_line_detection() {
        assert!(is_last_reply_line("220 ready"));
        assert!(is_last_reply_line("220"));
        assert!(!is_last_reply_line("220-more to come"));
    }
}
