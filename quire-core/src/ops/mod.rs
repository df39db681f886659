//! Edit operations exchanged between replicas.
//!
//! Wire shape (JSON, tagged by `kind`):
//! ```text
//! {"kind":"insert-text","path":[0,0],"offset":5,"text":"X"}
//! {"kind":"delete-text","path":[0,0],"offset":2,"len":3}
//! {"kind":"format","path":[0,0],"offset":0,"len":4,"key":"bold","value":"true"}
//! {"kind":"insert-node","path":[1],"node":{"type":"text","glyphs":[]}}
//! {"kind":"delete-node","path":[1]}
//! {"kind":"noop"}
//! ```

use serde::{Deserialize, Serialize};

use crate::{Attrs, Node, Path};

mod transform;

pub use transform::{Tie, Transform};

/// An atomic edit against the document tree.
///
/// Text offsets and lengths count Unicode scalar values (chars).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Operation {
    InsertText {
        path: Path,
        offset: usize,
        text: String,
        #[serde(default, skip_serializing_if = "Attrs::is_empty")]
        attrs: Attrs,
    },
    DeleteText {
        path: Path,
        offset: usize,
        len: usize,
    },
    /// Set (`Some`) or clear (`None`) one attribute over a char range.
    Format {
        path: Path,
        offset: usize,
        len: usize,
        key: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// Insert `node` so that it ends up at `path`.
    InsertNode { path: Path, node: Node },
    DeleteNode { path: Path },
    /// Result of transforming an edit whose target vanished.
    Noop,
}

impl Operation {
    pub fn insert_text(path: Path, offset: usize, text: impl Into<String>) -> Self {
        Operation::InsertText {
            path,
            offset,
            text: text.into(),
            attrs: Attrs::new(),
        }
    }

    pub fn delete_text(path: Path, offset: usize, len: usize) -> Self {
        Operation::DeleteText { path, offset, len }
    }

    pub fn format(
        path: Path,
        offset: usize,
        len: usize,
        key: impl Into<String>,
        value: Option<&str>,
    ) -> Self {
        Operation::Format {
            path,
            offset,
            len,
            key: key.into(),
            value: value.map(str::to_owned),
        }
    }

    pub fn insert_node(path: Path, node: Node) -> Self {
        Operation::InsertNode { path, node }
    }

    pub fn delete_node(path: Path) -> Self {
        Operation::DeleteNode { path }
    }

    /// The node this operation addresses (`None` for [`Operation::Noop`]).
    pub fn path(&self) -> Option<&[usize]> {
        match self {
            Operation::InsertText { path, .. }
            | Operation::DeleteText { path, .. }
            | Operation::Format { path, .. }
            | Operation::InsertNode { path, .. }
            | Operation::DeleteNode { path } => Some(path.as_slice()),
            Operation::Noop => None,
        }
    }

    fn path_mut(&mut self) -> Option<&mut Path> {
        match self {
            Operation::InsertText { path, .. }
            | Operation::DeleteText { path, .. }
            | Operation::Format { path, .. }
            | Operation::InsertNode { path, .. }
            | Operation::DeleteNode { path } => Some(path),
            Operation::Noop => None,
        }
    }

    /// Whether this op edits characters inside a text node.
    pub fn is_text_op(&self) -> bool {
        matches!(
            self,
            Operation::InsertText { .. } | Operation::DeleteText { .. } | Operation::Format { .. }
        )
    }
}
