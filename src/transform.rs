//! Conflict resolution between concurrent operations.
//!
//! `transform(a, b)` returns `(a', b')` where `a'` applies after `b` and `b'`
//! applies after `a`, and both orders produce the same text. Each side is a
//! sequence: a delete that straddles a concurrent insert splits in two, and a
//! delete entirely covered by a concurrent delete disappears.

use crate::error::{Result, SyncError};
use crate::operation::{OpKind, Operation};

/// Transform two operations computed against the same base version.
///
/// # Panics
///
/// Panics when the base versions differ. Callers handling untrusted input
/// use [`try_transform`].
pub fn transform(a: &Operation, b: &Operation) -> (Vec<Operation>, Vec<Operation>) {
    assert_eq!(
        a.base_version(),
        b.base_version(),
        "transform called on operations from different base versions"
    );
    transform_pair(a, b)
}

/// Checked [`transform`]: mismatched base versions are a protocol violation.
pub fn try_transform(a: &Operation, b: &Operation) -> Result<(Vec<Operation>, Vec<Operation>)> {
    if a.base_version() != b.base_version() {
        return Err(SyncError::ProtocolViolation(format!(
            "cannot transform {} against {}: base versions differ",
            a, b
        )));
    }
    Ok(transform_pair(a, b))
}

/// Transform two operation sequences that each apply to the same document.
///
/// Returns `(a', b')` with `a'` applying after all of `b` and `b'` after all
/// of `a`.
pub fn transform_seq(a: &[Operation], b: &[Operation]) -> (Vec<Operation>, Vec<Operation>) {
    match (a, b) {
        ([], _) => (Vec::new(), b.to_vec()),
        (_, []) => (a.to_vec(), Vec::new()),
        ([a0], [b0]) => transform_pair(a0, b0),
        ([a0, a_rest @ ..], _) if !a_rest.is_empty() => {
            let (mut a0_t, b_t) = transform_seq(std::slice::from_ref(a0), b);
            let (rest_t, b_tt) = transform_seq(a_rest, &b_t);
            a0_t.extend(rest_t);
            (a0_t, b_tt)
        }
        (_, [b0, b_rest @ ..]) => {
            let (a_t, mut b0_t) = transform_seq(a, std::slice::from_ref(b0));
            let (a_tt, rest_t) = transform_seq(&a_t, b_rest);
            b0_t.extend(rest_t);
            (a_tt, b0_t)
        }
    }
}

/// Apply a sequence of operations in order.
pub fn apply_all(text: &str, ops: &[Operation]) -> Result<String> {
    let mut result = text.to_string();
    for op in ops {
        result = op.apply(&result)?;
    }
    Ok(result)
}

fn transform_pair(a: &Operation, b: &Operation) -> (Vec<Operation>, Vec<Operation>) {
    match (&a.kind, &b.kind) {
        (OpKind::Insert { .. }, OpKind::Insert { .. }) => {
            let a_first =
                a.position < b.position || (a.position == b.position && a.precedes(b));
            if a_first {
                (vec![a.clone()], vec![b.moved_to(b.position + a.len())])
            } else {
                (vec![a.moved_to(a.position + b.len())], vec![b.clone()])
            }
        }
        (OpKind::Insert { .. }, OpKind::Delete { .. }) => {
            let (delete, insert) = insert_delete(a, b);
            (insert, delete)
        }
        (OpKind::Delete { .. }, OpKind::Insert { .. }) => insert_delete(b, a),
        (OpKind::Delete { .. }, OpKind::Delete { .. }) => {
            (delete_delete(a, b), delete_delete(b, a))
        }
    }
}

/// Returns (the delete rebased after the insert, the insert rebased after
/// the delete).
fn insert_delete(insert: &Operation, delete: &Operation) -> (Vec<Operation>, Vec<Operation>) {
    let at = insert.position;
    let inserted = insert.len();
    let (start, end) = (delete.position, delete.end());

    let insert_t = if at <= start {
        insert.clone()
    } else if at < end {
        // the text around the insert is gone
        insert.moved_to(start)
    } else {
        insert.moved_to(at - delete.len())
    };

    let delete_t = if start >= at {
        vec![delete.moved_to(start + inserted)]
    } else if end <= at {
        vec![delete.clone()]
    } else {
        vec![
            delete.delete_range(start, at - start),
            delete.delete_range(start + inserted, end - at),
        ]
    };

    (delete_t, vec![insert_t])
}

/// `a` rebased after `b`, both deletes.
fn delete_delete(a: &Operation, b: &Operation) -> Vec<Operation> {
    let overlap = a
        .end()
        .min(b.end())
        .saturating_sub(a.position.max(b.position));
    let remaining = a.len() - overlap;
    if remaining == 0 {
        return Vec::new();
    }

    let position = if a.position <= b.position {
        a.position
    } else if a.position < b.end() {
        b.position
    } else {
        a.position - b.len()
    };
    vec![a.delete_range(position, remaining)]
}
