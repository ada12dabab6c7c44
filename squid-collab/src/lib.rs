//! # squid-collab: mutation and notification core for Squid kanban boards
//!
//! Keeps columns and rows in dense `1..=N` order under concurrent edits and
//! pushes every committed change to the live WebSocket connections of the
//! users who can see the project.
//!
//! ## Architecture
//!
//! ```text
//!  handler ──► BoardService ──► ProjectDirectory ── role check
//!                  │
//!                  ├──► OrderCoordinator ── per-scope lock
//!                  │          │
//!                  │          ▼
//!                  │     BoardStore ── RocksStore / MemoryStore
//!                  │
//!                  └──► BroadcastHub ──► ConnectionRegistry ──► sockets
//!                                                  ▲
//!                             BoardServer ─────────┘ register / deregister
//! ```
//!
//! ## Modules
//!
//! - [`model`]: board entities and the shared ordered-item shape
//! - [`storage`]: atomic write sets over RocksDB or memory
//! - [`order`]: insert / move / delete with per-scope serialization
//! - [`auth`]: project roles and the member resolver
//! - [`registry`]: live connections per user
//! - [`broadcast`]: authorized fan-out with eviction of dead connections
//! - [`service`]: authorize → persist → broadcast for every operation
//! - [`protocol`]: JSON event frames
//! - [`server`] / [`client`]: WebSocket transport
//! - [`config`] / [`error`]: configuration and the error taxonomy

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod order;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use auth::{ProjectAuthSet, ProjectDirectory, Role, StoreDirectory};
pub use broadcast::{BroadcastHub, BroadcastStats, PublishReport};
pub use client::{BoardClient, ClientError, ConnectionState};
pub use config::{ConfigError, ServerConfig};
pub use error::{BoardError, BoardResult, Entity, ErrorResponse};
pub use model::{
    Checklist, Column, Comment, CommentSection, ItemBody, Label, LabelTarget, OrderedItem, Point,
    Priority, Project, Row, ScopeKind, ScopeRef,
};
pub use order::{Committed, OrderCoordinator, OrderOutcome, ScopeLocks};
pub use protocol::{Event, EventType, ProtocolError};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, TransportError};
pub use server::{BoardServer, HandshakeAuthenticator, ServerStats, TrustedHeaderAuth};
pub use service::{
    BoardService, ColumnChange, ColumnChanges, LabelChanges, NewColumn, NewLabel, NewPoint,
    NewProject, NewRow, PointChanges, ProjectChanges, RowChange, RowChanges,
};
pub use storage::{
    BoardStore, MemoryStore, RocksStore, ScopeStore, StoreConfig, StoreError, WriteOp, WriteSet,
};
