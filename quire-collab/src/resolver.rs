//! Rebases an incoming batch over concurrent history.
//!
//! ```text
//!            c1      c2      c3        (concurrent, in version order)
//!   b1 ──▶ b1' ──▶ b1'' ──▶ b1'''     each cᵢ is also moved past b1,
//!   b2 ──▶ …                          so b2 meets c's that include b1
//! ```
//!
//! Ties between ops at the same location go to the lexicographically smaller
//! client id on every replica.

use quire_core::{Tie, Transform};

/// Transform `ops` (authored by `client_id`) so they apply after every op in
/// `concurrent`. Each concurrent op carries its author's client id.
///
/// Ops that transform into no-ops are dropped.
pub fn resolve<'a, O>(
    client_id: &str,
    ops: Vec<O>,
    concurrent: impl IntoIterator<Item = (&'a str, &'a O)>,
) -> Vec<O>
where
    O: Transform + 'a,
{
    let mut history: Vec<(&str, O)> = concurrent
        .into_iter()
        .map(|(author, op)| (author, op.clone()))
        .collect();

    if history.is_empty() {
        return ops;
    }

    let mut resolved = Vec::with_capacity(ops.len());
    for op in ops {
        let mut current = op;
        for (author, seen) in history.iter_mut() {
            let tie = Tie::between(client_id, *author);
            let next = current.transform(seen, tie);
            *seen = seen.transform(&current, tie.flip());
            current = next;
        }
        if current.is_noop() {
            log::trace!("Dropped op from {} absorbed by concurrent history", client_id);
        } else {
            resolved.push(current);
        }
    }
    resolved
}
