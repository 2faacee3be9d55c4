use crate::delta::Delta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highlight for lines another participant just changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoration {
    pub file: String,
    pub author: String,
    /// One-based, inclusive
    pub start_line: usize,
    pub end_line: usize,
    pub ttl: Duration,
}

impl Decoration {
    /// Cover the lines `delta` touched in a document now `line_count` lines
    /// long. Full replacements cover everything.
    pub fn for_delta(
        file: &str,
        author: &str,
        delta: &Delta,
        line_count: usize,
        ttl: Duration,
    ) -> Self {
        let last = line_count.max(1);
        let (start_line, end_line) = delta.touched_lines().unwrap_or((1, last));
        Self {
            file: file.to_string(),
            author: author.to_string(),
            start_line: start_line.min(last),
            end_line: end_line.min(last),
            ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_inserted_lines() {
        let delta = Delta::LineRange {
            start_line: 2,
            removed: 0,
            inserted: vec!["a".into(), "b".into()],
        };
        let decoration =
            Decoration::for_delta("main.rs", "p2", &delta, 10, Duration::from_secs(1));
        assert_eq!((decoration.start_line, decoration.end_line), (3, 4));
    }

    #[test]
    fn stays_inside_the_document() {
        let delta = Delta::LineRange {
            start_line: 3,
            removed: 1,
            inserted: vec![],
        };
        let decoration = Decoration::for_delta("main.rs", "p2", &delta, 3, Duration::ZERO);
        assert_eq!((decoration.start_line, decoration.end_line), (3, 3));

        let full = Delta::FullReplace {
            content: "x\ny".into(),
        };
        let decoration = Decoration::for_delta("main.rs", "p2", &full, 2, Duration::ZERO);
        assert_eq!((decoration.start_line, decoration.end_line), (1, 2));
    }
}
