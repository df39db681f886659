//! # quire-core: shared document model for Quire
//!
//! A document is a tree of element and text nodes. Every node is addressed by
//! a [`Path`]: the child index at each level, starting below the root.
//!
//! ```text
//! root (element "doc")            path
//! ├── element "p"                 [0]
//! │   └── text "Hello"            [0, 0]
//! └── element "p"                 [1]
//!     ├── text "world"            [1, 0]
//!     └── element "img"           [1, 1]
//! ```
//!
//! Edits travel between replicas as [`Operation`] values. Concurrent
//! operations are reconciled with the pairwise [`Transform`] capability, which
//! the collaboration layer composes into batch transforms.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod ops;

pub use ops::{Operation, Tie, Transform};

/// Child index at each level below the root.
pub type Path = Vec<usize>;

/// Character-level formatting attributes (e.g. `bold = "true"`).
pub type Attrs = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("no node at path {0:?}")]
    InvalidPath(Path),
    #[error("node at {0:?} is not a text node")]
    NotText(Path),
    #[error("node at {0:?} is not an element")]
    NotElement(Path),
    #[error("range {offset}..{end} out of bounds (len {len}) at {path:?}")]
    OutOfBounds {
        path: Path,
        offset: usize,
        end: usize,
        len: usize,
    },
    #[error("the root node cannot be inserted or removed")]
    RootImmutable,
}

/// A single character with its formatting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Glyph {
    pub ch: char,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: Attrs,
}

impl Glyph {
    pub fn plain(ch: char) -> Self {
        Self {
            ch,
            attrs: Attrs::new(),
        }
    }
}

/// A node in the document tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Node {
    Element {
        tag: String,
        #[serde(default)]
        children: Vec<Node>,
    },
    Text {
        #[serde(default)]
        glyphs: Vec<Glyph>,
    },
}

impl Node {
    pub fn element(tag: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element {
            tag: tag.into(),
            children,
        }
    }

    /// Unformatted text node.
    pub fn text(content: &str) -> Self {
        Node::Text {
            glyphs: content.chars().map(Glyph::plain).collect(),
        }
    }

    /// Concatenated text content of this subtree.
    pub fn plain_text(&self) -> String {
        match self {
            Node::Text { glyphs } => glyphs.iter().map(|g| g.ch).collect(),
            Node::Element { children, .. } => children.iter().map(Node::plain_text).collect(),
        }
    }
}

/// The shared document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub root: Node,
}

impl Default for Document {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Document {
    /// Create a document whose root element holds `blocks`.
    pub fn new(blocks: Vec<Node>) -> Self {
        Self {
            root: Node::element("doc", blocks),
        }
    }

    /// Text of each top-level block, newline separated.
    pub fn plain_text(&self) -> String {
        match &self.root {
            Node::Element { children, .. } => children
                .iter()
                .map(Node::plain_text)
                .collect::<Vec<_>>()
                .join("\n"),
            text => text.plain_text(),
        }
    }

    pub fn node(&self, path: &[usize]) -> Result<&Node, DocError> {
        let mut current = &self.root;
        for (depth, &index) in path.iter().enumerate() {
            current = match current {
                Node::Element { children, .. } => children
                    .get(index)
                    .ok_or_else(|| DocError::InvalidPath(path[..=depth].to_vec()))?,
                Node::Text { .. } => return Err(DocError::InvalidPath(path[..=depth].to_vec())),
            };
        }
        Ok(current)
    }

    fn node_mut(&mut self, path: &[usize]) -> Result<&mut Node, DocError> {
        let mut current = &mut self.root;
        for (depth, &index) in path.iter().enumerate() {
            current = match current {
                Node::Element { children, .. } => children
                    .get_mut(index)
                    .ok_or_else(|| DocError::InvalidPath(path[..=depth].to_vec()))?,
                Node::Text { .. } => return Err(DocError::InvalidPath(path[..=depth].to_vec())),
            };
        }
        Ok(current)
    }

    fn glyphs_mut(&mut self, path: &[usize]) -> Result<&mut Vec<Glyph>, DocError> {
        match self.node_mut(path)? {
            Node::Text { glyphs } => Ok(glyphs),
            Node::Element { .. } => Err(DocError::NotText(path.to_vec())),
        }
    }

    fn children_mut(&mut self, path: &[usize]) -> Result<&mut Vec<Node>, DocError> {
        match self.node_mut(path)? {
            Node::Element { children, .. } => Ok(children),
            Node::Text { .. } => Err(DocError::NotElement(path.to_vec())),
        }
    }

    /// Apply a single operation. The document is unchanged on error.
    pub fn apply(&mut self, op: &Operation) -> Result<(), DocError> {
        match op {
            Operation::InsertText {
                path,
                offset,
                text,
                attrs,
            } => {
                let glyphs = self.glyphs_mut(path)?;
                check_range(path, *offset, 0, glyphs.len())?;
                let inserted = text.chars().map(|ch| Glyph {
                    ch,
                    attrs: attrs.clone(),
                });
                glyphs.splice(*offset..*offset, inserted);
            }
            Operation::DeleteText { path, offset, len } => {
                let glyphs = self.glyphs_mut(path)?;
                let end = check_range(path, *offset, *len, glyphs.len())?;
                glyphs.drain(*offset..end);
            }
            Operation::Format {
                path,
                offset,
                len,
                key,
                value,
            } => {
                let glyphs = self.glyphs_mut(path)?;
                let end = check_range(path, *offset, *len, glyphs.len())?;
                for glyph in &mut glyphs[*offset..end] {
                    match value {
                        Some(v) => {
                            glyph.attrs.insert(key.clone(), v.clone());
                        }
                        None => {
                            glyph.attrs.remove(key);
                        }
                    }
                }
            }
            Operation::InsertNode { path, node } => {
                let (&index, parent) = path.split_last().ok_or(DocError::RootImmutable)?;
                let children = self.children_mut(parent)?;
                if index > children.len() {
                    return Err(DocError::InvalidPath(path.clone()));
                }
                children.insert(index, node.clone());
            }
            Operation::DeleteNode { path } => {
                let (&index, parent) = path.split_last().ok_or(DocError::RootImmutable)?;
                let children = self.children_mut(parent)?;
                if index >= children.len() {
                    return Err(DocError::InvalidPath(path.clone()));
                }
                children.remove(index);
            }
            Operation::Noop => {}
        }
        Ok(())
    }

    /// Apply operations in order, stopping at the first failure.
    pub fn apply_all<'a>(
        &mut self,
        ops: impl IntoIterator<Item = &'a Operation>,
    ) -> Result<(), DocError> {
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }
}

/// Validate `offset..offset + len` against a text of `total` chars, returning the end.
fn check_range(path: &[usize], offset: usize, len: usize, total: usize) -> Result<usize, DocError> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(end),
        end => Err(DocError::OutOfBounds {
            path: path.to_vec(),
            offset,
            end: end.unwrap_or(usize::MAX),
            len: total,
        }),
    }
}
