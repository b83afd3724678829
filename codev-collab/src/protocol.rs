//! JSON wire protocol for the collaboration gateway.
//!
//! Event names are fixed for compatibility with existing clients
//! (`join-project`, `code-edit`, `code-updated`, ...). Each frame is a
//! JSON object `{ "event": <name>, "data": { ... } }` with camelCase
//! payload fields, sent as a WebSocket text message.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::DocumentSnapshot;
use crate::error::{ConflictReason, EngineError};
use crate::presence::{CursorPosition, PresenceEntry};
use crate::services::DeploymentStatus;
use crate::transform::Payload;

/// Inbound commands, decoded from client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinProject {
        project_id: String,
        user_id: String,
        username: String,
    },
    CodeEdit {
        project_id: String,
        document_id: String,
        operation: Payload,
        version: u64,
        user_id: String,
    },
    CursorMove {
        project_id: String,
        document_id: String,
        position: CursorPosition,
        user_id: String,
    },
    SaveFile {
        project_id: String,
        document_id: String,
        content: String,
        user_id: String,
    },
    PreviewUpdate {
        project_id: String,
        frontend_code: String,
        backend_code: String,
        mock_data: serde_json::Value,
    },
    DeployRequest {
        project_id: String,
        user_id: String,
        deployment_config: serde_json::Value,
    },
    LeaveProject {
        project_id: String,
    },
}

impl ClientEvent {
    pub fn decode(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::MalformedMessage(e.to_string()))
    }
}

/// Outbound events, encoded once and fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Join reply: current presence (join order) plus every loaded
    /// document's content and version, so the new participant needs no
    /// separate fetch round trip.
    ProjectState {
        users: Vec<PresenceEntry>,
        documents: Vec<DocumentSnapshot>,
    },
    UserJoined {
        connection_id: Uuid,
        user_id: String,
        username: String,
    },
    UserLeft {
        connection_id: Uuid,
        username: String,
    },
    CodeUpdated {
        document_id: String,
        operation: Payload,
        version: u64,
        user_id: String,
        timestamp: u64,
    },
    VersionConflict {
        document_id: String,
        #[serde(flatten)]
        conflict: ConflictReason,
    },
    CursorUpdated {
        document_id: String,
        position: CursorPosition,
        user_id: String,
        connection_id: Uuid,
    },
    FileSaved {
        document_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        timestamp: u64,
    },
    PreviewChanged {
        frontend_code: String,
        backend_code: String,
        mock_data: serde_json::Value,
        timestamp: u64,
    },
    DeploymentStarted {
        deployment_id: Uuid,
        status: DeploymentStatus,
    },
    DeploymentUpdate {
        deployment_id: Uuid,
        status: DeploymentStatus,
        user_id: String,
    },
    DeploymentError {
        error: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::MalformedMessage(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::MalformedMessage(e.to_string()))
    }
}
