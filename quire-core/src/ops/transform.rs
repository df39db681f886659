//! Pairwise operational transform for [`Operation`].
//!
//! `a.transform(&b, tie)` rewrites `a` so it can be applied to a document on
//! which `b` has already been applied. For any concurrent pair the results
//! satisfy the convergence property:
//!
//! ```text
//! apply(a); apply(b.transform(&a, tie.flip()))
//!   ==  apply(b); apply(a.transform(&b, tie))
//! ```
//!
//! Rules, by the kind of `b`:
//! - node insert/delete: `a`'s path is shifted past the changed sibling, or
//!   `a` becomes [`Operation::Noop`] when its target lies inside a deleted
//!   subtree.
//! - text ops on the same node: offsets shift; deleted ranges shrink to the
//!   surviving chars; an insert strictly inside a deleted range is absorbed
//!   by the delete; an insert strictly inside a formatted range inherits the
//!   attribute; overlapping formats of the same key both cover the union with
//!   the winner's value.
//!
//! Reference: Ellis & Gibbs, Concurrency Control in Groupware Systems (1989)

use std::cmp::Ordering;

use super::Operation;

/// Which side wins when two ops address the identical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    /// The op being transformed is placed first / keeps its value.
    Left,
    Right,
}

impl Tie {
    /// Tie for an op authored by `mine` against one authored by `theirs`.
    ///
    /// The lexicographically smaller client id wins, so every replica makes
    /// the same choice regardless of arrival order.
    pub fn between(mine: &str, theirs: &str) -> Self {
        if mine <= theirs {
            Tie::Left
        } else {
            Tie::Right
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Tie::Left => Tie::Right,
            Tie::Right => Tie::Left,
        }
    }
}

/// The capability the collaboration layer needs from an operation type.
pub trait Transform: Clone {
    /// Rewrite `self` to apply after `other`.
    fn transform(&self, other: &Self, tie: Tie) -> Self;

    /// Ops for which this returns true may be dropped from a batch.
    fn is_noop(&self) -> bool {
        false
    }
}

impl Transform for Operation {
    fn transform(&self, other: &Operation, tie: Tie) -> Operation {
        if self.is_noop() {
            return Operation::Noop;
        }
        match other {
            Operation::Noop => self.clone(),
            Operation::InsertNode { path, .. } => self.across_node_insert(path, tie),
            Operation::DeleteNode { path } => self.across_node_delete(path),
            _ if self.is_text_op() && self.path() == other.path() => self.across_text(other, tie),
            _ => self.clone(),
        }
    }

    fn is_noop(&self) -> bool {
        matches!(self, Operation::Noop)
    }
}

impl Operation {
    /// Index of `at` that this op's path shares a parent with, if any.
    fn sibling_depth(&self, at: &[usize]) -> Option<usize> {
        let path = self.path()?;
        let depth = at.len().checked_sub(1)?;
        (path.len() >= at.len() && path[..depth] == at[..depth]).then_some(depth)
    }

    fn with_index(&self, depth: usize, index: usize) -> Operation {
        let mut op = self.clone();
        if let Some(path) = op.path_mut() {
            path[depth] = index;
        }
        op
    }

    /// Whether this op inserts a node as a sibling at exactly `at`'s depth.
    fn inserts_beside(&self, at: &[usize]) -> bool {
        matches!(self, Operation::InsertNode { path, .. } if path.len() == at.len())
    }

    fn across_node_insert(&self, at: &[usize], tie: Tie) -> Operation {
        let Some(depth) = self.sibling_depth(at) else {
            return self.clone();
        };
        let Some(path) = self.path() else {
            return self.clone();
        };
        let shift = match path[depth].cmp(&at[depth]) {
            Ordering::Greater => true,
            Ordering::Less => false,
            // The existing node at this index moves right; a competing
            // insert at the same slot goes by tie.
            Ordering::Equal => !(self.inserts_beside(at) && tie == Tie::Left),
        };
        if shift {
            self.with_index(depth, path[depth].saturating_add(1))
        } else {
            self.clone()
        }
    }

    fn across_node_delete(&self, at: &[usize]) -> Operation {
        let Some(depth) = self.sibling_depth(at) else {
            return self.clone();
        };
        let Some(path) = self.path() else {
            return self.clone();
        };
        match path[depth].cmp(&at[depth]) {
            Ordering::Less => self.clone(),
            Ordering::Greater => self.with_index(depth, path[depth] - 1),
            Ordering::Equal if self.inserts_beside(at) => self.clone(),
            Ordering::Equal => Operation::Noop,
        }
    }

    /// Both ops are text ops on the same node.
    fn across_text(&self, other: &Operation, tie: Tie) -> Operation {
        match (self, other) {
            (
                Operation::InsertText {
                    path,
                    offset,
                    text,
                    attrs,
                },
                Operation::InsertText {
                    offset: theirs,
                    text: their_text,
                    ..
                },
            ) => {
                let offset = if *theirs < *offset || (*theirs == *offset && tie == Tie::Right) {
                    offset.saturating_add(char_len(their_text))
                } else {
                    *offset
                };
                Operation::InsertText {
                    path: path.clone(),
                    offset,
                    text: text.clone(),
                    attrs: attrs.clone(),
                }
            }
            (
                Operation::InsertText {
                    path,
                    offset,
                    text,
                    attrs,
                },
                Operation::DeleteText {
                    offset: del,
                    len: del_len,
                    ..
                },
            ) => {
                if *offset <= *del {
                    self.clone()
                } else if *offset >= del.saturating_add(*del_len) {
                    Operation::InsertText {
                        path: path.clone(),
                        offset: offset.saturating_sub(*del_len),
                        text: text.clone(),
                        attrs: attrs.clone(),
                    }
                } else {
                    // Swallowed by the delete, which grows to cover it.
                    Operation::Noop
                }
            }
            (
                Operation::InsertText {
                    path,
                    offset,
                    text,
                    attrs,
                },
                Operation::Format {
                    offset: start,
                    len,
                    key,
                    value,
                    ..
                },
            ) => {
                if strictly_inside(*offset, *start, *len) {
                    let mut attrs = attrs.clone();
                    match value {
                        Some(v) => {
                            attrs.insert(key.clone(), v.clone());
                        }
                        None => {
                            attrs.remove(key);
                        }
                    }
                    Operation::InsertText {
                        path: path.clone(),
                        offset: *offset,
                        text: text.clone(),
                        attrs,
                    }
                } else {
                    self.clone()
                }
            }
            (
                Operation::DeleteText { path, offset, len },
                Operation::InsertText {
                    offset: ins,
                    text, ..
                },
            ) => {
                let (offset, len) = grow_for_insert(*offset, *len, *ins, char_len(text));
                Operation::DeleteText {
                    path: path.clone(),
                    offset,
                    len,
                }
            }
            (
                Operation::DeleteText { path, offset, len },
                Operation::DeleteText {
                    offset: del,
                    len: del_len,
                    ..
                },
            ) => match shrink_for_delete(*offset, *len, *del, *del_len) {
                Some((offset, len)) => Operation::DeleteText {
                    path: path.clone(),
                    offset,
                    len,
                },
                None => Operation::Noop,
            },
            (
                Operation::Format {
                    path,
                    offset,
                    len,
                    key,
                    value,
                },
                Operation::InsertText {
                    offset: ins,
                    text, ..
                },
            ) => {
                let (offset, len) = grow_for_insert(*offset, *len, *ins, char_len(text));
                Operation::Format {
                    path: path.clone(),
                    offset,
                    len,
                    key: key.clone(),
                    value: value.clone(),
                }
            }
            (
                Operation::Format {
                    path,
                    offset,
                    len,
                    key,
                    value,
                },
                Operation::DeleteText {
                    offset: del,
                    len: del_len,
                    ..
                },
            ) => match shrink_for_delete(*offset, *len, *del, *del_len) {
                Some((offset, len)) => Operation::Format {
                    path: path.clone(),
                    offset,
                    len,
                    key: key.clone(),
                    value: value.clone(),
                },
                None => Operation::Noop,
            },
            (
                Operation::Format {
                    path,
                    offset,
                    len,
                    key,
                    value,
                },
                Operation::Format {
                    offset: their_offset,
                    len: their_len,
                    key: their_key,
                    value: their_value,
                    ..
                },
            ) => {
                let end = offset.saturating_add(*len);
                let their_end = their_offset.saturating_add(*their_len);
                if key != their_key || end <= *their_offset || their_end <= *offset {
                    return self.clone();
                }
                let start = (*offset).min(*their_offset);
                let value = match tie {
                    Tie::Left => value.clone(),
                    Tie::Right => their_value.clone(),
                };
                Operation::Format {
                    path: path.clone(),
                    offset: start,
                    len: end.max(their_end) - start,
                    key: key.clone(),
                    value,
                }
            }
            // Deletes are unaffected by formatting.
            _ => self.clone(),
        }
    }
}

// Offsets and lengths are client input; range arithmetic saturates so an
// out-of-range op stays out of range and is refused at apply time.

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn strictly_inside(pos: usize, start: usize, len: usize) -> bool {
    start < pos && pos < start.saturating_add(len)
}

/// Range `offset..offset + len` after `n` chars were inserted at `at`.
fn grow_for_insert(offset: usize, len: usize, at: usize, n: usize) -> (usize, usize) {
    if at <= offset {
        (offset.saturating_add(n), len)
    } else if at >= offset.saturating_add(len) {
        (offset, len)
    } else {
        (offset, len.saturating_add(n))
    }
}

/// Surviving part of `offset..offset + len` after `del..del + del_len` was removed.
///
/// The survivors are contiguous once the deleted chars are gone, so the result
/// is a single range; `None` when nothing survives.
fn shrink_for_delete(offset: usize, len: usize, del: usize, del_len: usize) -> Option<(usize, usize)> {
    let end = offset.saturating_add(len);
    let del_end = del.saturating_add(del_len);
    if end <= del {
        return (len > 0).then_some((offset, len));
    }
    if del_end <= offset {
        return (len > 0).then_some((offset.saturating_sub(del_len), len));
    }
    let before = del.saturating_sub(offset);
    let after = end.saturating_sub(del_end);
    let remaining = before.saturating_add(after);
    (remaining > 0).then_some((offset.min(del), remaining))
}
