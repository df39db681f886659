//! Ephemeral presence: who is where in the document.
//!
//! Awareness never touches the operation log. Clients send partial updates
//! and the room keeps one merged [`AwarenessState`] per member:
//!
//! ```text
//! stored   {cursor: A, selection: S, name: "Ada"}
//! update   {cursor: B, selection: null}
//! merged   {cursor: B, selection: ∅,  name: "Ada"}
//! ```

use serde::{Deserialize, Deserializer, Serialize};

use crate::protocol::{ClientId, ClientInfo};

/// A caret location: node path plus char offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub path: Vec<usize>,
    pub offset: usize,
}

impl Position {
    pub fn new(path: Vec<usize>, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Position,
    pub focus: Position,
}

/// Merged presence of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub client_id: ClientId,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
}

/// Partial awareness update as sent by a client.
///
/// `selection` and `cursor` are double options: the outer `None` means the
/// field was absent (keep), `Some(None)` means an explicit `null` (clear).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(
        default,
        deserialize_with = "explicit",
        skip_serializing_if = "Option::is_none"
    )]
    pub selection: Option<Option<Selection>>,
    #[serde(
        default,
        deserialize_with = "explicit",
        skip_serializing_if = "Option::is_none"
    )]
    pub cursor: Option<Option<Position>>,
}

/// A present field, `null` included, becomes `Some(..)`.
fn explicit<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl AwarenessUpdate {
    pub fn cursor(position: Position) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    pub fn selection(anchor: Position, focus: Position) -> Self {
        Self {
            selection: Some(Some(Selection { anchor, focus })),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn clear_cursor(mut self) -> Self {
        self.cursor = Some(None);
        self
    }

    pub fn clear_selection(mut self) -> Self {
        self.selection = Some(None);
        self
    }
}

/// Three-way merge: `update` wins, then `existing`, then the member's
/// `defaults` (name and color only).
pub fn merge(
    existing: Option<&AwarenessState>,
    update: AwarenessUpdate,
    defaults: &ClientInfo,
) -> AwarenessState {
    let name = update
        .name
        .or_else(|| existing.map(|s| s.name.clone()))
        .unwrap_or_else(|| defaults.name.clone());
    let color = update
        .color
        .or_else(|| existing.map(|s| s.color.clone()))
        .unwrap_or_else(|| defaults.color.clone());
    let selection = match update.selection {
        Some(selection) => selection,
        None => existing.and_then(|s| s.selection.clone()),
    };
    let cursor = match update.cursor {
        Some(cursor) => cursor,
        None => existing.and_then(|s| s.cursor.clone()),
    };

    AwarenessState {
        client_id: defaults.id.clone(),
        name,
        color,
        selection,
        cursor,
    }
}
