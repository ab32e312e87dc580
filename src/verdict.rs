//! Review verdict parsing from critic output.
//!
//! Critics answer in free text. The parser looks for a fixed vocabulary:
//! - approval: `APPROVED`
//! - rejection: `REJECTED` or `NEEDS_REVISION` (also `needs revision`, `needs-revision`)
//!
//! Matching is case-insensitive and on whole words. Lines that mention
//! `verdict` are consulted first; when they settle nothing, the whole text is
//! scanned. A scope that contains both vocabularies, or neither, is
//! `Unparseable`, which callers must treat as a rejection.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static VERDICT_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^.*\bverdict\b.*$").unwrap());

static APPROVED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bapproved\b").unwrap());

static REJECTED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:rejected|needs[_\s-]?revision)\b").unwrap());

/// Outcome of parsing one critic review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
    /// No decisive verdict. Folded into rejection by the revision loop.
    Unparseable,
}

impl Verdict {
    /// Only an explicit approval counts; `Unparseable` fails closed.
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Unparseable => "unparseable",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a critic's free-text review into a verdict.
pub fn parse_verdict(text: &str) -> Verdict {
    let from_verdict_lines = VERDICT_LINE_REGEX
        .find_iter(text)
        .map(|line| classify(line.as_str()))
        .find(|verdict| *verdict != Verdict::Unparseable);

    from_verdict_lines.unwrap_or_else(|| classify(text))
}

fn classify(scope: &str) -> Verdict {
    let approved = APPROVED_REGEX.is_match(scope);
    let rejected = REJECTED_REGEX.is_match(scope);
    match (approved, rejected) {
        (true, false) => Verdict::Approved,
        (false, true) => Verdict::Rejected,
        _ => Verdict::Unparseable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_approved() {
        assert_eq!(parse_verdict("APPROVED"), Verdict::Approved);
        assert_eq!(parse_verdict("Looks good, approved."), Verdict::Approved);
    }

    #[test]
    fn test_plain_rejected() {
        assert_eq!(parse_verdict("Rejected: missing tests"), Verdict::Rejected);
        assert_eq!(parse_verdict("NEEDS_REVISION"), Verdict::Rejected);
        assert_eq!(parse_verdict("This needs revision."), Verdict::Rejected);
    }

    #[test]
    fn test_verdict_line_wins_over_body() {
        let review = "1. **Verdict**: NEEDS_REVISION\n\
                      2. **Score**: 5\n\
                      Once fixed this would be approved.";
        assert_eq!(parse_verdict(review), Verdict::Rejected);

        let review = "The earlier draft was rejected, this one is fine.\n\
                      Verdict: APPROVED";
        assert_eq!(parse_verdict(review), Verdict::Approved);
    }

    #[test]
    fn test_echoed_template_is_unparseable() {
        let review = "Verdict: APPROVED or NEEDS_REVISION\n\nI could not decide.";
        assert_eq!(parse_verdict(review), Verdict::Unparseable);
    }

    #[test]
    fn test_later_verdict_line_used_when_first_is_ambiguous() {
        let review = "Verdict: APPROVED or NEEDS_REVISION\n...\nFinal verdict: rejected";
        assert_eq!(parse_verdict(review), Verdict::Rejected);
    }

    #[test]
    fn test_both_vocabularies_without_verdict_line_is_unparseable() {
        let review = "Parts are approved, other parts rejected.";
        assert_eq!(parse_verdict(review), Verdict::Unparseable);
    }

    #[test]
    fn test_no_vocabulary_is_unparseable() {
        assert_eq!(parse_verdict(""), Verdict::Unparseable);
        assert_eq!(parse_verdict("Score: 9/10, great work"), Verdict::Unparseable);
    }

    #[test]
    fn test_whole_words_only() {
        assert_eq!(parse_verdict("unapproved changes"), Verdict::Unparseable);
        assert_eq!(parse_verdict("APPROVED_WITH_CHANGES"), Verdict::Unparseable);
    }

    #[test]
    fn test_unparseable_is_not_approval() {
        assert!(!Verdict::Unparseable.is_approved());
        assert!(!Verdict::Rejected.is_approved());
        assert!(Verdict::Approved.is_approved());
    }
}
