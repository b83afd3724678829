//! Presence tracking: who is connected to a project and where their
//! cursors are.
//!
//! One tracker per project session. Participants are kept in join order
//! so presence listings are deterministic. A participant is one live
//! connection, not one user — a user with two tabs open is two
//! participants. Cursor updates are last-write-wins, broadcast-only, and
//! never persisted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor position inside a document (editor coordinates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// One live connection in a project session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub connection_id: Uuid,
    pub user_id: String,
    pub username: String,
    pub joined_at_ms: u64,
    pub last_activity_ms: u64,
    /// Last known cursor per document, last-write-wins.
    pub cursors: HashMap<String, CursorPosition>,
}

impl Participant {
    pub fn new(
        connection_id: Uuid,
        user_id: impl Into<String>,
        username: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            username: username.into(),
            joined_at_ms: now_ms,
            last_activity_ms: now_ms,
            cursors: HashMap::new(),
        }
    }
}

/// Wire-facing presence entry (the subset clients see).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub connection_id: Uuid,
    pub user_id: String,
    pub username: String,
}

impl From<&Participant> for PresenceEntry {
    fn from(p: &Participant) -> Self {
        Self {
            connection_id: p.connection_id,
            user_id: p.user_id.clone(),
            username: p.username.clone(),
        }
    }
}

/// Join-ordered set of participants for one project.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    participants: Vec<Participant>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant. A duplicate connection id replaces the prior
    /// entry in place (reconnection semantics), keeping its slot in the
    /// join order. Returns the replaced entry, if any.
    pub fn add(&mut self, participant: Participant) -> Option<Participant> {
        if let Some(existing) = self
            .participants
            .iter_mut()
            .find(|p| p.connection_id == participant.connection_id)
        {
            return Some(std::mem::replace(existing, participant));
        }
        self.participants.push(participant);
        None
    }

    /// Remove by connection id. Unknown ids are a no-op.
    pub fn remove(&mut self, connection_id: Uuid) -> Option<Participant> {
        let idx = self
            .participants
            .iter()
            .position(|p| p.connection_id == connection_id)?;
        Some(self.participants.remove(idx))
    }

    pub fn get(&self, connection_id: Uuid) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
    }

    /// Participants in join order.
    pub fn list(&self) -> &[Participant] {
        &self.participants
    }

    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.participants.iter().map(PresenceEntry::from).collect()
    }

    pub fn connection_ids(&self) -> Vec<Uuid> {
        self.participants.iter().map(|p| p.connection_id).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Record a cursor move. Returns false for unknown connections.
    pub fn update_cursor(
        &mut self,
        connection_id: Uuid,
        document_id: &str,
        position: CursorPosition,
        now_ms: u64,
    ) -> bool {
        match self
            .participants
            .iter_mut()
            .find(|p| p.connection_id == connection_id)
        {
            Some(p) => {
                p.cursors.insert(document_id.to_string(), position);
                p.last_activity_ms = now_ms;
                true
            }
            None => false,
        }
    }

    /// Bump a participant's last-activity timestamp.
    pub fn touch(&mut self, connection_id: Uuid, now_ms: u64) {
        if let Some(p) = self
            .participants
            .iter_mut()
            .find(|p| p.connection_id == connection_id)
        {
            p.last_activity_ms = now_ms;
        }
    }

    /// True when every participant has been inactive longer than
    /// `timeout_ms` as of `now_ms`. An empty tracker is idle.
    pub fn all_idle(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.participants
            .iter()
            .all(|p| now_ms.saturating_sub(p.last_activity_ms) > timeout_ms)
    }
}
