use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Line-granular description of how one snapshot became another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    /// Replace the whole document
    FullReplace { content: String },
    /// Replace `removed` lines starting at `start_line` (zero-based) with
    /// `inserted`
    LineRange {
        start_line: usize,
        removed: usize,
        inserted: Vec<String>,
    },
}

impl Delta {
    /// A change that leaves every line in place.
    pub fn is_noop(&self) -> bool {
        matches!(self, Delta::LineRange { removed: 0, inserted, .. } if inserted.is_empty())
    }

    /// Net change in line count, for `LineRange` deltas.
    pub fn line_shift(&self) -> Option<isize> {
        match self {
            Delta::FullReplace { .. } => None,
            Delta::LineRange {
                removed, inserted, ..
            } => Some(inserted.len() as isize - *removed as isize),
        }
    }

    /// One-based inclusive span of lines touched in the new document.
    /// Pure deletions report the line that now sits at the seam.
    pub fn touched_lines(&self) -> Option<(usize, usize)> {
        match self {
            Delta::FullReplace { .. } => None,
            Delta::LineRange {
                start_line,
                inserted,
                ..
            } => Some((
                start_line.saturating_add(1),
                start_line.saturating_add(inserted.len().max(1)),
            )),
        }
    }

    /// Apply to a text snapshot rather than its lines.
    pub fn apply_text(&self, text: &str) -> Result<String> {
        apply(&lines_of(text), self).map(|lines| join_lines(&lines))
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delta::FullReplace { content } => {
                write!(f, "full replace ({} lines)", lines_of(content).len())
            }
            Delta::LineRange {
                start_line,
                removed,
                inserted,
            } => write!(
                f,
                "{} lines at {} -> {} new",
                removed,
                start_line,
                inserted.len()
            ),
        }
    }
}

/// Split text into lines. The empty string is one empty line and a trailing
/// newline yields a trailing empty line, so `join_lines` inverts this.
pub fn lines_of(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

pub fn join_lines(lines: &[String]) -> String {
    lines.join("\n")
}

fn is_blank(lines: &[String]) -> bool {
    match lines {
        [] => true,
        [only] => only.is_empty(),
        _ => false,
    }
}

/// Encode the change from `old` to `new`.
///
/// Trims the common prefix and suffix of the line arrays and describes the
/// differing middle as one `LineRange`. This is linear, not minimal. With
/// no previous snapshot, or an empty one, the result is a `FullReplace`.
pub fn encode(old: Option<&[String]>, new: &[String]) -> Delta {
    let old = match old {
        Some(old) if !is_blank(old) => old,
        _ => {
            return Delta::FullReplace {
                content: join_lines(new),
            }
        }
    };

    let mut start = 0;
    while start < old.len() && start < new.len() && old[start] == new[start] {
        start += 1;
    }

    let mut common_end = 0;
    while common_end < old.len() - start
        && common_end < new.len() - start
        && old[old.len() - 1 - common_end] == new[new.len() - 1 - common_end]
    {
        common_end += 1;
    }

    Delta::LineRange {
        start_line: start,
        removed: old.len() - start - common_end,
        inserted: new[start..new.len() - common_end].to_vec(),
    }
}

/// Apply `delta` to `lines`.
pub fn apply(lines: &[String], delta: &Delta) -> Result<Vec<String>> {
    match delta {
        Delta::FullReplace { content } => Ok(lines_of(content)),
        Delta::LineRange {
            start_line,
            removed,
            inserted,
        } => {
            let end = start_line
                .checked_add(*removed)
                .filter(|end| *end <= lines.len())
                .ok_or_else(|| {
                    SyncError::ProtocolViolation(format!(
                        "line range of {} starting at {} exceeds a {} line buffer",
                        removed,
                        start_line,
                        lines.len()
                    ))
                })?;
            let mut result = Vec::with_capacity(lines.len() - removed + inserted.len());
            result.extend_from_slice(&lines[..*start_line]);
            result.extend(inserted.iter().cloned());
            result.extend_from_slice(&lines[end..]);
            Ok(result)
        }
    }
}
