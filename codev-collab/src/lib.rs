//! # codev-collab — Real-time collaborative editing engine
//!
//! In-memory, process-scoped collaboration service: multiple users edit
//! the same logical document (a project's "frontend"/"backend" source),
//! every participant's view converges on one authoritative
//! content + version, and presence (who is online, cursor positions)
//! propagates with low latency.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   WebSocket (JSON)   ┌───────────────────┐
//! │  Client ×N │ ◄──────────────────► │ ConnectionGateway │
//! └────────────┘                      └─────────┬─────────┘
//!                                               │
//!                                     ┌─────────▼─────────┐
//!                                     │  SessionRegistry  │  per project:
//!                                     │                   │  PresenceTracker
//!                                     │                   │  + DocumentState
//!                                     └─────────┬─────────┘  (serialized
//!                                               │             submits)
//!                                ┌──────────────┼──────────────┐
//!                                ▼              ▼              ▼
//!                          FileService    DeployService   idle sweep
//!                          (external)      (external)     (backstop)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire events (names fixed for client compatibility)
//! - [`transform`] — operation transformation for concurrent edits
//! - [`document`] — authoritative content + version + bounded op log
//! - [`presence`] — join-ordered roster and cursor tracking
//! - [`registry`] — session lifecycle: create on join, tear down on empty,
//!   idle sweep for ungraceful disconnects
//! - [`gateway`] — WebSocket server, command routing, room-scoped fan-out
//! - [`services`] — external persistence/deployment collaborator contracts
//!
//! Durability is the file service's job, invoked on explicit save and
//! never on the hot edit path; the engine's own state lives and dies
//! with the process.

pub mod document;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod services;
pub mod transform;

pub use document::{Applied, DocumentSnapshot, DocumentState, LoggedOperation, RetentionPolicy};
pub use error::{ConflictReason, EngineError};
pub use gateway::{CollabServer, ConnectionGateway, ServerConfig};
pub use presence::{CursorPosition, Participant, PresenceEntry, PresenceTracker};
pub use protocol::{ClientEvent, ServerEvent};
pub use registry::{
    EngineConfig, JoinOutcome, LeaveOutcome, SessionRegistry, SessionSnapshot, SweeperHandle,
};
pub use services::{
    Deployment, DeploymentStatus, DeployService, FileService, FileType, InMemoryDeployService,
    InMemoryFileService, SavedFile, ServiceError,
};
pub use transform::{apply, transform, Edit, Payload};
