//! SMTP reply parser.
//!
//! SMTP replies can be single-line or multi-line:
//! - Single: `250 OK\r\n`
//! - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
//!
//! The parser is fed one line at a time (CRLF already removed) so the
//! connection can stop reading as soon as the terminal line arrives.

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Number of digits in a reply code.
const CODE_LEN: usize = 3;

/// Incremental parser for one (possibly multi-line) reply.
#[derive(Debug, Default)]
pub struct ReplyParser {
    message: Vec<String>,
}

impl ReplyParser {
    /// Creates an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one reply line without its CRLF terminator.
    ///
    /// Returns `Ok(Some(reply))` when the line completes the reply and
    /// `Ok(None)` when more lines are expected.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the line has no leading three-digit code
    /// or the code is followed by anything other than `' '` or `'-'`.
    pub fn feed(&mut self, line: &str) -> Result<Option<Reply>> {
        let bytes = line.as_bytes();
        if bytes.len() < CODE_LEN || !bytes[..CODE_LEN].iter().all(u8::is_ascii_digit) {
            return Err(Error::Protocol(format!("no code in reply line: {line}")));
        }

        let code = ReplyCode::new(
            bytes[..CODE_LEN]
                .iter()
                .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')),
        );

        match bytes.get(CODE_LEN) {
            // bare code, last line
            None => {
                self.message.push(String::new());
                Ok(Some(self.take(code)))
            }
            Some(b' ') => {
                self.message.push(line[CODE_LEN + 1..].to_string());
                Ok(Some(self.take(code)))
            }
            Some(b'-') => {
                self.message.push(line[CODE_LEN + 1..].to_string());
                Ok(None)
            }
            Some(_) => Err(Error::Protocol(format!(
                "bad code termination in reply line: {line}"
            ))),
        }
    }

    /// Called when the stream ends before a terminal line.
    ///
    /// # Errors
    ///
    /// Always returns a protocol error carrying whatever text was gathered.
    pub fn finish(self) -> Result<Reply> {
        if self.message.is_empty() {
            Err(Error::Protocol("incomplete reply".into()))
        } else {
            Err(Error::Protocol(format!(
                "incomplete reply: {}",
                self.message.join("\n")
            )))
        }
    }

    fn take(&mut self, code: ReplyCode) -> Reply {
        Reply::new(code, std::mem::take(&mut self.message))
    }
}

/// Parses a complete SMTP reply from its lines.
///
/// # Errors
///
/// Returns an error if the reply is malformed, if a line follows the
/// terminal line, or if no terminal line is present.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let mut parser = ReplyParser::new();
    let mut lines = lines.iter();
    while let Some(line) = lines.next() {
        if let Some(reply) = parser.feed(line)? {
            if let Some(extra) = lines.next() {
                return Err(Error::Protocol(format!(
                    "line after last reply line: {extra}"
                )));
            }
            return Ok(reply);
        }
    }
    parser.finish()
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
    use proptest::prelude::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_single_line_reply() {
        let reply = parse_reply(&lines(&["250 OK"])).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message_text(), "OK");
        assert!(reply.is_positive_completion());
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let reply = parse_reply(&lines(&["250-A", "250-B", "250 C"])).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec!["A", "B", "C"]);
        assert_eq!(reply.message_text(), "A\nB\nC");
    }

    #[test]
    fn test_parse_greeting() {
        let reply = parse_reply(&lines(&["220 smtp.example.com ESMTP ready"])).unwrap();
        assert_eq!(reply.code.as_u16(), 220);
        assert_eq!(reply.message, vec!["smtp.example.com ESMTP ready"]);
    }

    #[test]
    fn test_bare_code_is_terminal() {
        let reply = parse_reply(&lines(&["354"])).unwrap();
        assert!(reply.is_positive_intermediate());
        assert_eq!(reply.message_text(), "");
    }

    #[test]
    fn test_no_code() {
        let err = parse_reply(&lines(&["ABC OK"])).unwrap_err();
        assert!(err.to_string().contains("no code in reply line"));
        assert!(parse_reply(&lines(&["25"])).is_err());
        assert!(parse_reply(&lines(&["2a0 OK"])).is_err());
    }

    #[test]
    fn test_bad_code_termination() {
        let err = parse_reply(&lines(&["250+OK"])).unwrap_err();
        assert!(err.to_string().contains("bad code termination"));
    }

    #[test]
    fn test_incomplete_reply() {
        let err = parse_reply(&lines(&["250-A", "250-B"])).unwrap_err();
        assert!(err.to_string().contains("incomplete reply"));
        assert!(parse_reply(&[]).is_err());
    }

    #[test]
    fn test_line_after_terminal() {
        assert!(parse_reply(&lines(&["250 A", "250 B"])).is_err());
    }

    #[test]
    fn test_parser_is_reusable() {
        let mut parser = ReplyParser::new();
        assert!(parser.feed("250-first").unwrap().is_none());
        let reply = parser.feed("250 second").unwrap().unwrap();
        assert_eq!(reply.message.len(), 2);
        let reply = parser.feed("221 bye").unwrap().unwrap();
        assert_eq!(reply.message, vec!["bye"]);
    }

    proptest! {
        #[test]
        fn single_line_round_trips(code in 100u16..1000, text in "[ -~]{0,60}") {
            let line = format!("{code} {text}");
            let reply = parse_reply(&[line]).unwrap();
            prop_assert_eq!(reply.code.as_u16(), code);
            prop_assert_eq!(reply.message_text(), text);
        }

        #[test]
        fn continuation_lines_are_joined(texts in proptest::collection::vec("[a-zA-Z0-9 ]{0,20}", 1..6)) {
            let last = texts.len() - 1;
            let raw: Vec<String> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| format!("250{}{t}", if i == last { ' ' } else { '-' }))
                .collect();
            let reply = parse_reply(&raw).unwrap();
            prop_assert_eq!(reply.message_text(), texts.join("\n"));
        }
    }
}
