//! # quire-collab: collaboration rooms for Quire documents
//!
//! Many clients edit one structured document at once. Each document lives in
//! a [`Room`] that orders submissions, rebases stale ones over concurrent
//! history and fans the result out to every member.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │
//! │ (per user)  │     JSON frames    │ (transport)  │
//! └─────────────┘                    └──────┬───────┘
//!                                           │ room id from URL path
//!                                           ▼
//!                                    ┌──────────────┐
//!                                    │ RoomRegistry │
//!                                    └──────┬───────┘
//!                                           ▼
//!                  ┌──────────────────── Room ─────────────────────┐
//!                  │ version · OperationLog · awareness · members  │
//!                  └───┬──────────────┬──────────────┬─────────────┘
//!                      ▼              ▼              ▼
//!                  resolver       awareness     BroadcastGroup
//!                 (transform)      (merge)        (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`room`]: the per-document session
//! - [`oplog`]: version-ordered history with bounded retention
//! - [`resolver`]: batch transform against concurrent history
//! - [`awareness`]: ephemeral presence and its three-way merge
//! - [`broadcast`]: best-effort fan-out through [`ClientSink`]s
//! - [`registry`]: room lookup, creation and reaping
//! - [`protocol`]: JSON wire messages
//! - [`server`] / [`client`]: WebSocket transport
//!
//! The room core is generic over any operation type implementing
//! [`quire_core::Transform`]; the transport adds serde bounds.

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod oplog;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use awareness::{AwarenessState, AwarenessUpdate, Position, Selection};
pub use broadcast::{BroadcastGroup, BroadcastStats, ClientHandle, ClientSink, SendError};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use oplog::{LogEntry, LogError, OperationLog, Retention};
pub use protocol::{ClientId, ClientInfo, ClientMessage, JoinParams, ProtocolError, ServerMessage};
pub use registry::{RegistryStatus, RoomRegistry};
pub use room::{Room, RoomConfig, RoomError, SubmitError};
pub use server::{ServerConfig, ServerStats, SyncServer};
