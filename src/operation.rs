use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// What an operation does at its position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    /// Insert text at position
    Insert { text: String },
    /// Delete `len` characters starting at position
    Delete { len: usize },
}

/// Authorship metadata shared by every operation derived from one edit.
///
/// The derived ordering compares `base_version`, then `order`, then `origin`,
/// which is the tie-break every replica uses to decide which of two
/// concurrent inserts at the same position comes first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub base_version: u64,
    pub order: u64,
    pub origin: String,
}

impl Stamp {
    pub fn new(origin: impl Into<String>, order: u64, base_version: u64) -> Self {
        Self {
            base_version,
            order,
            origin: origin.into(),
        }
    }
}

/// A single insert or delete against the document as it was at
/// `stamp.base_version`. Positions count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireOperation")]
pub struct Operation {
    #[serde(flatten)]
    pub kind: OpKind,
    pub position: usize,
    #[serde(flatten)]
    pub stamp: Stamp,
}

/// Decoded operations go through the constructors.
#[derive(Deserialize)]
struct WireOperation {
    #[serde(flatten)]
    kind: OpKind,
    position: usize,
    #[serde(flatten)]
    stamp: Stamp,
}

impl TryFrom<WireOperation> for Operation {
    type Error = SyncError;

    fn try_from(wire: WireOperation) -> Result<Self> {
        match wire.kind {
            OpKind::Insert { text } => Operation::insert(wire.position, text, wire.stamp),
            OpKind::Delete { len } => Operation::delete(wire.position, len, wire.stamp),
        }
    }
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>, stamp: Stamp) -> Result<Self> {
        let text = text.into();
        if text.is_empty() {
            return Err(SyncError::EmptyEdit);
        }
        Ok(Self {
            kind: OpKind::Insert { text },
            position,
            stamp,
        })
    }

    pub fn delete(position: usize, len: usize, stamp: Stamp) -> Result<Self> {
        if len == 0 {
            return Err(SyncError::EmptyEdit);
        }
        Ok(Self {
            kind: OpKind::Delete { len },
            position,
            stamp,
        })
    }

    pub fn origin(&self) -> &str {
        &self.stamp.origin
    }

    pub fn base_version(&self) -> u64 {
        self.stamp.base_version
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    /// Number of characters inserted or deleted.
    pub fn len(&self) -> usize {
        match &self.kind {
            OpKind::Insert { text } => text.chars().count(),
            OpKind::Delete { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the last character this operation touches in its base
    /// document. Inserts touch nothing, so this is their position.
    pub fn end(&self) -> usize {
        match self.kind {
            OpKind::Insert { .. } => self.position,
            OpKind::Delete { len } => self.position.saturating_add(len),
        }
    }

    /// Whether `self` sorts before `other` in the total order, i.e. wins a
    /// position tie against it.
    pub fn precedes(&self, other: &Operation) -> bool {
        self.cmp(other) == Ordering::Less
    }

    pub(crate) fn moved_to(&self, position: usize) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    /// A copy of a delete with a new range. Callers never shrink to zero.
    pub(crate) fn delete_range(&self, position: usize, len: usize) -> Self {
        debug_assert!(len > 0);
        Self {
            kind: OpKind::Delete { len },
            position,
            stamp: self.stamp.clone(),
        }
    }

    /// Apply this operation to `text`, returning the edited text.
    pub fn apply(&self, text: &str) -> Result<String> {
        let start = byte_offset(text, self.position).ok_or_else(|| {
            SyncError::ProtocolViolation(format!(
                "position {} is past the end of a {} character document",
                self.position,
                text.chars().count()
            ))
        })?;

        let mut result = String::with_capacity(text.len());
        match &self.kind {
            OpKind::Insert { text: insert_text } => {
                result.push_str(&text[..start]);
                result.push_str(insert_text);
                result.push_str(&text[start..]);
            }
            OpKind::Delete { len } => {
                let end = self
                    .position
                    .checked_add(*len)
                    .and_then(|end| byte_offset(text, end))
                    .ok_or_else(|| {
                        SyncError::ProtocolViolation(format!(
                            "delete of {} at {} runs past the end of the document",
                            len, self.position
                        ))
                    })?;
                result.push_str(&text[..start]);
                result.push_str(&text[end..]);
            }
        }
        Ok(result)
    }
}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Operation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stamp
            .cmp(&other.stamp)
            .then_with(|| self.position.cmp(&other.position))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Insert { text } => write!(f, "insert {:?} at {}", text, self.position)?,
            OpKind::Delete { len } => write!(f, "delete {} at {}", len, self.position)?,
        }
        write!(
            f,
            " ({}#{} @v{})",
            self.stamp.origin, self.stamp.order, self.stamp.base_version
        )
    }
}

/// Byte index of the `char_pos`-th character, or `text.len()` when
/// `char_pos` is exactly the character count.
pub(crate) fn byte_offset(text: &str, char_pos: usize) -> Option<usize> {
    let mut count = 0;
    for (index, _) in text.char_indices() {
        if count == char_pos {
            return Some(index);
        }
        count += 1;
    }
    (count == char_pos).then_some(text.len())
}
