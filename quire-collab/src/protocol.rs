//! JSON wire protocol between clients and rooms.
//!
//! Every frame is one JSON object tagged by `type`:
//! ```text
//! client → room   {"type":"ops","version":3,"ops":[...]}
//!                 {"type":"awareness","cursor":{"path":[0,0],"offset":4}}
//!
//! room → client   {"type":"sync","clientId":"…","version":3,"clients":[…],"awareness":[…]}
//!                 {"type":"client-joined","clientId":"…","name":"Ada","color":"#5fa8e8"}
//!                 {"type":"client-left","clientId":"…"}
//!                 {"type":"ops","version":4,"clientId":"…","ops":[...]}
//!                 {"type":"awareness","state":{…}}
//!                 {"type":"rejected","baseVersion":9,"version":4,"reason":"future-version"}
//! ```
//!
//! Operations are carried as-is; their shape belongs to the document model.

use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::awareness::{AwarenessState, AwarenessUpdate};

/// Connection-scoped client identifier (UUID v4 string).
pub type ClientId = String;

/// Room selected when the connection request names none.
pub const DEFAULT_ROOM: &str = "default";

/// Display name used when the connection request names none.
pub const ANONYMOUS: &str = "Anonymous";

/// Client identity with display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    /// Display hint for cursors and selections (`#rrggbb`).
    pub color: String,
}

impl ClientInfo {
    /// Fresh identity with a new UUID and a color derived from it.
    pub fn new(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id: id.to_string(),
            name: name.into(),
            color: color_for(id),
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Stable, vivid color for a client id.
///
/// The hue comes from the UUID bits; saturation and lightness are fixed so
/// cursors stay readable on a light background.
pub fn color_for(id: Uuid) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Messages a client sends to its room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage<O> {
    /// Edit batch authored against room version `version`.
    Ops { version: u64, ops: Vec<O> },
    /// Partial presence update; absent fields keep their previous value.
    Awareness(AwarenessUpdate),
}

/// Messages a room (or the transport on its behalf) sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage<O> {
    /// One-time snapshot for a newly joined client.
    #[serde(rename_all = "camelCase")]
    Sync {
        /// The id the room assigned to the receiving client.
        client_id: ClientId,
        version: u64,
        /// Members present before the receiver joined.
        clients: Vec<ClientInfo>,
        awareness: Vec<AwarenessState>,
    },
    #[serde(rename_all = "camelCase")]
    ClientJoined {
        client_id: ClientId,
        name: String,
        color: String,
    },
    #[serde(rename_all = "camelCase")]
    ClientLeft { client_id: ClientId },
    /// An accepted batch, already transformed against concurrent history.
    #[serde(rename_all = "camelCase")]
    Ops {
        version: u64,
        client_id: ClientId,
        ops: Vec<O>,
    },
    Awareness { state: AwarenessState },
    /// Direct reply to a submission the room refused.
    #[serde(rename_all = "camelCase")]
    Rejected {
        base_version: u64,
        version: u64,
        reason: String,
    },
}

impl<O: Serialize> ClientMessage<O> {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl<O: DeserializeOwned> ClientMessage<O> {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl<O: Serialize> ServerMessage<O> {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl<O: DeserializeOwned> ServerMessage<O> {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Room and identity hints carried by the connection request
/// (`/<room>?name=<name>&color=<color>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub room: String,
    pub name: Option<String>,
    pub color: Option<String>,
}

impl Default for JoinParams {
    fn default() -> Self {
        Self {
            room: DEFAULT_ROOM.to_string(),
            name: None,
            color: None,
        }
    }
}

impl JoinParams {
    /// Parse a request target such as `/design-review?name=Ada%20L`.
    pub fn from_request_target(target: &str) -> Result<Self, ProtocolError> {
        let parsed = Url::parse(&format!("ws://localhost{target}"))
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

        let room = parsed
            .path_segments()
            .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            .map(percent_decode)
            .unwrap_or_else(|| DEFAULT_ROOM.to_string());

        let mut params = JoinParams {
            room,
            ..JoinParams::default()
        };
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "name" if !value.is_empty() => params.name = Some(value.into_owned()),
                "color" if !value.is_empty() => params.color = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(params)
    }

    /// Connection URL for `server_url` carrying these params.
    pub fn to_url(&self, server_url: &str) -> Result<Url, ProtocolError> {
        let mut url = Url::parse(server_url).map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ProtocolError::Handshake(format!("{server_url} cannot carry a path")))?
            .pop_if_empty()
            .push(&self.room);
        {
            let mut query = url.query_pairs_mut();
            if let Some(name) = &self.name {
                query.append_pair("name", name);
            }
            if let Some(color) = &self.color {
                query.append_pair("color", color);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

/// Path segments arrive percent-encoded; query pairs are decoded by `url`.
fn percent_decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Handshake error: {0}")]
    Handshake(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("A submission is still waiting for its echo")]
    SubmissionInFlight,
}
