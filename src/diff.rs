use crate::operation::{Operation, Stamp};

/// BLAKE3 hash of a document's text, hex encoded.
pub fn checksum(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Create the operations that turn `from` into `to`.
///
/// Strips the common character prefix and suffix and describes the middle as
/// at most one delete followed by one insert at the same position. Both
/// operations carry `stamp`; the insert applies to the text left by the
/// delete.
pub fn diff_ops(from: &str, to: &str, stamp: &Stamp) -> Vec<Operation> {
    if from == to {
        return Vec::new();
    }

    let from_chars: Vec<char> = from.chars().collect();
    let to_chars: Vec<char> = to.chars().collect();

    let mut common_start = 0;
    while common_start < from_chars.len()
        && common_start < to_chars.len()
        && from_chars[common_start] == to_chars[common_start]
    {
        common_start += 1;
    }

    let mut common_end = 0;
    while common_end < from_chars.len() - common_start
        && common_end < to_chars.len() - common_start
        && from_chars[from_chars.len() - 1 - common_end] == to_chars[to_chars.len() - 1 - common_end]
    {
        common_end += 1;
    }

    let removed = from_chars.len() - common_start - common_end;
    let inserted: String = to_chars[common_start..to_chars.len() - common_end]
        .iter()
        .collect();

    let mut ops = Vec::with_capacity(2);
    if let Ok(delete) = Operation::delete(common_start, removed, stamp.clone()) {
        ops.push(delete);
    }
    if let Ok(insert) = Operation::insert(common_start, inserted, stamp.clone()) {
        ops.push(insert);
    }
    ops
}
