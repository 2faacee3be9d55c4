//! Caret positions for every known participant, kept valid as edits land.

use crate::delta::Delta;
use crate::error::SyncError;
use crate::operation::{OpKind, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A participant's caret. Lines and columns are one-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireCursor")]
pub struct CursorPosition {
    pub owner: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Deserialize)]
struct WireCursor {
    owner: String,
    line: usize,
    column: usize,
}

impl TryFrom<WireCursor> for CursorPosition {
    type Error = SyncError;

    fn try_from(wire: WireCursor) -> Result<Self, Self::Error> {
        if wire.line == 0 || wire.column == 0 {
            return Err(SyncError::ProtocolViolation(format!(
                "cursor {}:{} for {} is not one-based",
                wire.line, wire.column, wire.owner
            )));
        }
        Ok(Self {
            owner: wire.owner,
            line: wire.line,
            column: wire.column,
        })
    }
}

impl CursorPosition {
    pub fn new(owner: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            owner: owner.into(),
            line: line.max(1),
            column: column.max(1),
        }
    }

    /// Start of the document.
    pub fn home(owner: impl Into<String>) -> Self {
        Self::new(owner, 1, 1)
    }

    /// Character offset of this cursor in `lines`, after clamping it into
    /// them.
    pub fn offset_in(&self, lines: &[String]) -> usize {
        let clamped = self.clamp_to(lines);
        let before: usize = lines[..clamped.line - 1]
            .iter()
            .map(|line| line.chars().count() + 1)
            .sum();
        before + clamped.column - 1
    }

    /// The cursor sitting at character `offset` of `lines`. Offsets past the
    /// end land on the last position.
    pub fn at_offset(owner: impl Into<String>, lines: &[String], offset: usize) -> Self {
        let mut remaining = offset;
        for (index, line) in lines.iter().enumerate() {
            let len = line.chars().count();
            if remaining <= len {
                return Self::new(owner, index + 1, remaining + 1);
            }
            remaining -= len + 1;
        }
        let last = lines.last().map_or(0, |line| line.chars().count());
        Self::new(owner, lines.len().max(1), last + 1)
    }

    /// Pull the cursor back inside `lines`.
    pub fn clamp_to(&self, lines: &[String]) -> Self {
        if lines.is_empty() {
            return Self::home(self.owner.clone());
        }
        let line = self.line.clamp(1, lines.len());
        let max_column = lines[line - 1].chars().count() + 1;
        Self::new(self.owner.clone(), line, self.column.clamp(1, max_column))
    }

    /// Rebase across `op`, which turned `before` into `after`.
    pub fn rebase_operation(&self, op: &Operation, before: &[String], after: &[String]) -> Self {
        let offset = rebase_offset(self.offset_in(before), op);
        Self::at_offset(self.owner.clone(), after, offset)
    }

    /// Rebase across `delta`, whose result is `after`.
    pub fn rebase_delta(&self, delta: &Delta, after: &[String]) -> Self {
        match delta {
            Delta::FullReplace { .. } => self.clamp_to(after),
            Delta::LineRange {
                start_line,
                removed,
                inserted,
            } => {
                let index = self.line.saturating_sub(1);
                let moved = if index >= start_line.saturating_add(*removed) {
                    let line = index
                        .saturating_add(inserted.len())
                        .saturating_sub(*removed)
                        .saturating_add(1);
                    Self::new(self.owner.clone(), line, self.column)
                } else if index >= *start_line {
                    Self::new(self.owner.clone(), start_line.saturating_add(1), self.column)
                } else {
                    self.clone()
                };
                moved.clamp_to(after)
            }
        }
    }
}

impl fmt::Display for CursorPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.owner, self.line, self.column)
    }
}

/// Move a character offset across `op`. Offsets inside a deleted range land
/// on its start.
pub fn rebase_offset(offset: usize, op: &Operation) -> usize {
    match &op.kind {
        OpKind::Insert { .. } => {
            if op.position <= offset {
                offset.saturating_add(op.len())
            } else {
                offset
            }
        }
        OpKind::Delete { len } => {
            if offset <= op.position {
                offset
            } else if offset < op.position.saturating_add(*len) {
                op.position
            } else {
                offset - len
            }
        }
    }
}

/// One cursor per known participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorSet {
    cursors: BTreeMap<String, CursorPosition>,
}

impl CursorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a participant, starting at the top of the document.
    pub fn join(&mut self, owner: &str) {
        self.cursors
            .entry(owner.to_string())
            .or_insert_with(|| CursorPosition::home(owner));
    }

    pub fn leave(&mut self, owner: &str) -> Option<CursorPosition> {
        self.cursors.remove(owner)
    }

    /// An explicit move reported by the cursor's owner.
    pub fn move_to(&mut self, cursor: CursorPosition, lines: &[String]) -> CursorPosition {
        let cursor = cursor.clamp_to(lines);
        self.cursors.insert(cursor.owner.clone(), cursor.clone());
        cursor
    }

    pub fn get(&self, owner: &str) -> Option<&CursorPosition> {
        self.cursors.get(owner)
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.cursors.contains_key(owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CursorPosition> {
        self.cursors.values()
    }

    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.cursors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn rebase_delta(&mut self, delta: &Delta, after: &[String]) {
        for cursor in self.cursors.values_mut() {
            *cursor = cursor.rebase_delta(delta, after);
        }
    }

    pub fn rebase_operation(&mut self, op: &Operation, before: &[String], after: &[String]) {
        for cursor in self.cursors.values_mut() {
            *cursor = cursor.rebase_operation(op, before, after);
        }
    }
}
