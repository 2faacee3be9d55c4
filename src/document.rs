use crate::delta::{self, join_lines, lines_of, Delta};
use crate::diff::checksum;
use crate::error::Result;
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A document snapshot: its lines plus a version bumped once per applied
/// change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    lines: Vec<String>,
    pub version: u64,
}

impl Document {
    pub fn new(content: &str) -> Self {
        Self::new_with_version(content, 0)
    }

    pub fn new_with_version(content: &str, version: u64) -> Self {
        Self {
            lines: lines_of(content),
            version,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn text(&self) -> String {
        join_lines(&self.lines)
    }

    pub fn checksum(&self) -> String {
        checksum(&self.text())
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Characters in the document, newlines included.
    pub fn len(&self) -> usize {
        let chars: usize = self.lines.iter().map(|line| line.chars().count()).sum();
        chars + self.lines.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.len() == 1 && self.lines[0].is_empty()
    }

    /// Replace the content wholesale and bump the version.
    pub fn update(&mut self, new_content: &str) {
        self.lines = lines_of(new_content);
        self.version += 1;
    }

    /// Apply a delta and bump the version. On error nothing changes.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<()> {
        self.lines = delta::apply(&self.lines, delta)?;
        if self.lines.is_empty() {
            self.lines.push(String::new());
        }
        self.version += 1;
        Ok(())
    }

    /// Apply an operation and bump the version. On error nothing changes.
    pub fn apply_operation(&mut self, op: &Operation) -> Result<()> {
        let text = op.apply(&self.text())?;
        self.update(&text);
        Ok(())
    }

    /// Take over another snapshot's content and version.
    pub fn reset(&mut self, content: &str, version: u64) {
        self.lines = lines_of(content);
        self.version = version;
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (v{})", self.text(), self.version)
    }
}

impl From<&str> for Document {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

impl From<String> for Document {
    fn from(content: String) -> Self {
        Self::new(&content)
    }
}
