//! # flowchart-collab: live sessions for the flowchart editor
//!
//! Keeps each client's replica of the shared document joined to its peers
//! and reconciles it with the last saved snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   SurfaceEvent   ┌──────────────┐
//! │ ReconciliationCtrl   │ ◄─────────────── │ diagram      │
//! │                      │ ───────────────► │ surface      │
//! └───┬─────────────┬────┘   RenderState    └──────────────┘
//!     │             │
//!     ▼             ▼
//! ┌─────────┐  ┌──────────────┐   HTTP    ┌──────────────┐
//! │ Peer    │  │ Snapshot     │ ◄───────► │ /data        │
//! │ Session │  │ Client       │           │ endpoint     │
//! └───┬─────┘  └──────────────┘           └──────────────┘
//!     │ WebSocket (bincode SyncMessage)
//!     ▼
//! ┌─────────────┐
//! │ RelayServer │ ── Room per session ── BroadcastGroup
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Per-session fan-out with backpressure
//! - [`room`]: Session id to room mapping
//! - [`server`]: WebSocket session relay
//! - [`client`]: WebSocket client with offline queue
//! - [`session`]: A peer's replica joined to a session
//! - [`persistence`]: Snapshot endpoint client
//! - [`controller`]: Bootstrap and live reconciliation

pub mod broadcast;
pub mod client;
pub mod controller;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use controller::{BootstrapOutcome, ControllerConfig, Phase, ReconciliationController};
pub use error::SyncError;
pub use persistence::{PersistenceConfig, SnapshotClient, SnapshotPersistence, TransportError};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use room::{Room, RoomManager};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{PeerSession, SessionConfig, DEFAULT_SESSION};
