//! SMTP reply types.

/// SMTP reply from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Reply text, one entry per reply line with the code prefix removed.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Returns true for a positive completion reply (2xx).
    #[must_use]
    pub const fn is_positive_completion(&self) -> bool {
        self.code.is_positive_completion()
    }

    /// Returns true for a positive intermediate reply (3xx).
    #[must_use]
    pub const fn is_positive_intermediate(&self) -> bool {
        self.code.is_positive_intermediate()
    }

    /// Returns true for a transient negative completion reply (4xx).
    #[must_use]
    pub const fn is_transient_negative(&self) -> bool {
        self.code.is_transient_negative()
    }

    /// Returns true for a permanent negative completion reply (5xx).
    #[must_use]
    pub const fn is_permanent_negative(&self) -> bool {
        self.code.is_permanent_negative()
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message_text())
    }
}

/// SMTP reply code.
///
/// Any three-digit value can be carried; only 200–599 fall into one of the
/// four bands and everything else satisfies no predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a positive completion code (2xx).
    #[must_use]
    pub const fn is_positive_completion(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a positive intermediate code (3xx).
    #[must_use]
    pub const fn is_positive_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }

    /// Returns true if this is a transient negative code (4xx).
    #[must_use]
    pub const fn is_transient_negative(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent negative code (5xx).
    #[must_use]
    pub const fn is_permanent_negative(self) -> bool {
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
    use proptest::prelude::*;

    fn bands(code: ReplyCode) -> [bool; 4] {
        [
            code.is_positive_completion(),
            code.is_positive_intermediate(),
            code.is_transient_negative(),
            code.is_permanent_negative(),
        ]
    }

    mod reply_code_tests {
        use super::*;

        #[test]
        fn band_edges() {
            assert_eq!(bands(ReplyCode::new(199)), [false; 4]);
            assert_eq!(bands(ReplyCode::new(200)), [true, false, false, false]);
            assert_eq!(bands(ReplyCode::new(299)), [true, false, false, false]);
            assert_eq!(bands(ReplyCode::new(300)), [false, true, false, false]);
            assert_eq!(bands(ReplyCode::new(599)), [false, false, false, true]);
            assert_eq!(bands(ReplyCode::new(600)), [false; 4]);
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", ReplyCode::new(250)), "250");
            assert_eq!(format!("{}", ReplyCode::new(500)), "500");
        }
    }

    mod reply_tests {
        use super::*;

        #[test]
        fn predicates_follow_code() {
            let reply = Reply::new(ReplyCode::new(450), vec!["Busy".to_string()]);
            assert!(!reply.is_positive_completion());
            assert!(reply.is_transient_negative());
            assert!(!reply.is_permanent_negative());
        }

        #[test]
        fn message_text_joins_lines() {
            let reply = Reply::new(
                ReplyCode::new(250),
                vec!["A".to_string(), "B".to_string(), "C".to_string()],
            );
            assert_eq!(reply.message_text(), "A\nB\nC");
            assert_eq!(reply.to_string(), "250 A\nB\nC");
        }

        #[test]
        fn message_text_empty() {
            let reply = Reply::new(ReplyCode::new(250), vec![]);
            assert_eq!(reply.message_text(), "");
        }
    }

    proptest! {
        #[test]
        fn exactly_one_band_inside_200_to_599(code in 200u16..600) {
            let hits = bands(ReplyCode::new(code)).iter().filter(|b| **b).count();
            prop_assert_eq!(hits, 1);
            let expected = usize::from(code / 100 - 2);
            prop_assert!(bands(ReplyCode::new(code))[expected]);
        }

        #[test]
        fn no_band_outside_200_to_599(code in prop_oneof![0u16..200, 600u16..1000]) {
            prop_assert_eq!(bands(ReplyCode::new(code)), [false; 4]);
        }
    }
}
