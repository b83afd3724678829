//! Per-project session registry: presence + documents, created on first
//! join, torn down when the last participant leaves.
//!
//! The registry is an owned object constructed at process start and
//! injected into the gateway; there is no process-wide state. Presence
//! and document locks are independent so a slow edit never blocks cursor
//! updates. The idle sweep is a registry-owned task with an explicit
//! handle, started by the server and aborted on shutdown; it is a
//! correctness backstop for ungraceful disconnects, not the primary
//! removal path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::document::{DocumentSnapshot, DocumentState, RetentionPolicy};
use crate::presence::{CursorPosition, Participant, PresenceEntry, PresenceTracker};

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sessions whose every participant has been inactive this long are
    /// evicted by the sweep.
    pub idle_timeout: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
    /// Operation log retention per document.
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            retention: RetentionPolicy::default(),
        }
    }
}

/// What a joining participant needs to initialize its local copy.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub users: Vec<PresenceEntry>,
    pub documents: Vec<DocumentSnapshot>,
}

/// Result of a join, including any implicit leave from a previous
/// project (a participant belongs to exactly one session at a time).
#[derive(Debug)]
pub struct JoinOutcome {
    pub snapshot: SessionSnapshot,
    pub previous: Option<PreviousLeave>,
}

#[derive(Debug)]
pub struct PreviousLeave {
    pub project_id: String,
    pub participant: Participant,
    pub session_closed: bool,
}

/// Result of an explicit leave. An unknown connection is a no-op
/// `NotFound`, not an error.
#[derive(Debug)]
pub enum LeaveOutcome {
    NotFound,
    Removed {
        participant: Participant,
        session_closed: bool,
    },
}

struct ProjectSession {
    presence: RwLock<PresenceTracker>,
    documents: RwLock<HashMap<String, Arc<Mutex<DocumentState>>>>,
}

impl ProjectSession {
    fn new() -> Self {
        Self {
            presence: RwLock::new(PresenceTracker::new()),
            documents: RwLock::new(HashMap::new()),
        }
    }

    async fn document(
        &self,
        project_id: &str,
        document_id: &str,
        retention: RetentionPolicy,
    ) -> Arc<Mutex<DocumentState>> {
        // Fast path: read lock.
        {
            let docs = self.documents.read().await;
            if let Some(doc) = docs.get(document_id) {
                return doc.clone();
            }
        }

        let mut docs = self.documents.write().await;
        docs.entry(document_id.to_string())
            .or_insert_with(|| {
                log::debug!("document {project_id}/{document_id} created");
                Arc::new(Mutex::new(DocumentState::new(retention)))
            })
            .clone()
    }
}

/// Registry of live project sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ProjectSession>>>,
    /// Which project each live connection currently belongs to.
    connections: RwLock<HashMap<Uuid, String>>,
    config: EngineConfig,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add a participant to a project session, creating the session on
    /// first join. Idempotent: a duplicate connection id replaces the
    /// prior entry. A connection joining a second project implicitly
    /// leaves its previous one.
    pub async fn join(&self, project_id: &str, participant: Participant) -> JoinOutcome {
        let connection_id = participant.connection_id;

        // Implicit leave of a previous, different project.
        let previous_project = self.connections.read().await.get(&connection_id).cloned();
        let previous = match previous_project {
            Some(prev) if prev != project_id => {
                match self.leave(&prev, connection_id).await {
                    LeaveOutcome::Removed {
                        participant,
                        session_closed,
                    } => Some(PreviousLeave {
                        project_id: prev,
                        participant,
                        session_closed,
                    }),
                    LeaveOutcome::NotFound => None,
                }
            }
            _ => None,
        };

        let (session, rejoined) = self.insert_participant(project_id, participant).await;
        if rejoined {
            log::debug!("connection {connection_id} rejoined project {project_id}");
        }
        self.connections
            .write()
            .await
            .insert(connection_id, project_id.to_string());

        let snapshot = self.snapshot(&session).await;
        log::info!(
            "connection {connection_id} joined project {project_id} ({} online)",
            snapshot.users.len()
        );
        JoinOutcome { snapshot, previous }
    }

    /// Remove a participant from a project. Tears the session down when
    /// it becomes empty; no session survives with an empty presence set.
    pub async fn leave(&self, project_id: &str, connection_id: Uuid) -> LeaveOutcome {
        let session = match self.sessions.read().await.get(project_id) {
            Some(s) => s.clone(),
            None => return LeaveOutcome::NotFound,
        };

        let (removed, now_empty) = {
            let mut presence = session.presence.write().await;
            let removed = presence.remove(connection_id);
            (removed, presence.is_empty())
        };
        let participant = match removed {
            Some(p) => p,
            None => return LeaveOutcome::NotFound,
        };

        self.connections.write().await.remove(&connection_id);

        // Teardown must re-check under the map's write lock: a join can
        // land between the emptiness observation above and here (joins
        // insert presence while holding the map lock), and the entry may
        // already be a different session recreated after an earlier
        // teardown.
        let session_closed = if now_empty {
            let mut sessions = self.sessions.write().await;
            let still_empty = match sessions.get(project_id) {
                Some(current) if Arc::ptr_eq(current, &session) => {
                    current.presence.read().await.is_empty()
                }
                _ => false,
            };
            if still_empty {
                sessions.remove(project_id);
                log::info!("project {project_id} session torn down (last participant left)");
            }
            still_empty
        } else {
            false
        };
        LeaveOutcome::Removed {
            participant,
            session_closed,
        }
    }

    /// Leave via the connection's registered project (disconnect path).
    pub async fn disconnect(&self, connection_id: Uuid) -> Option<(String, Participant, bool)> {
        let project_id = self.connections.read().await.get(&connection_id).cloned()?;
        match self.leave(&project_id, connection_id).await {
            LeaveOutcome::Removed {
                participant,
                session_closed,
            } => Some((project_id, participant, session_closed)),
            LeaveOutcome::NotFound => None,
        }
    }

    /// Handle to a document's state, creating an empty version-0
    /// document (and its session) on first access. Only the holder of
    /// the returned mutex may mutate content/version/log.
    pub async fn document(
        &self,
        project_id: &str,
        document_id: &str,
    ) -> Arc<Mutex<DocumentState>> {
        let session = self.get_or_create(project_id).await;
        session
            .document(project_id, document_id, self.config.retention)
            .await
    }

    /// Like [`document`](Self::document), but only for projects with a
    /// live session: returns `None` instead of instantiating one. The
    /// gateway's edit path goes through here so that an edit racing a
    /// teardown can never resurrect an empty session.
    pub async fn live_document(
        &self,
        project_id: &str,
        document_id: &str,
    ) -> Option<Arc<Mutex<DocumentState>>> {
        let session = self.sessions.read().await.get(project_id).cloned()?;
        Some(
            session
                .document(project_id, document_id, self.config.retention)
                .await,
        )
    }

    pub async fn has_session(&self, project_id: &str) -> bool {
        self.sessions.read().await.contains_key(project_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Presence entries for a project, join order. Empty if no session.
    pub async fn presence(&self, project_id: &str) -> Vec<PresenceEntry> {
        match self.sessions.read().await.get(project_id) {
            Some(session) => session.presence.read().await.entries(),
            None => Vec::new(),
        }
    }

    /// Connection ids currently in a project, join order.
    pub async fn connections_in(&self, project_id: &str) -> Vec<Uuid> {
        match self.sessions.read().await.get(project_id) {
            Some(session) => session.presence.read().await.connection_ids(),
            None => Vec::new(),
        }
    }

    /// Bump a participant's activity timestamp.
    pub async fn touch(&self, project_id: &str, connection_id: Uuid, now_ms: u64) {
        if let Some(session) = self.sessions.read().await.get(project_id) {
            session.presence.write().await.touch(connection_id, now_ms);
        }
    }

    /// Record a cursor move. Returns false for unknown sessions or
    /// connections.
    pub async fn update_cursor(
        &self,
        project_id: &str,
        connection_id: Uuid,
        document_id: &str,
        position: CursorPosition,
        now_ms: u64,
    ) -> bool {
        match self.sessions.read().await.get(project_id) {
            Some(session) => session
                .presence
                .write()
                .await
                .update_cursor(connection_id, document_id, position, now_ms),
            None => false,
        }
    }

    /// Evict every session whose participants are all inactive past the
    /// idle timeout (stale bookkeeping from ungraceful disconnects
    /// included). Returns the number of sessions evicted.
    pub async fn sweep(&self, now_ms: u64) -> usize {
        let timeout_ms = self.config.idle_timeout.as_millis() as u64;

        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (project_id, session) in sessions.iter() {
                if session.presence.read().await.all_idle(now_ms, timeout_ms) {
                    expired.push(project_id.clone());
                }
            }
        }

        let mut evicted = 0;
        for project_id in expired {
            let removed = {
                let mut sessions = self.sessions.write().await;
                // Re-check under the write lock: someone may have joined
                // since the scan.
                let still_idle = match sessions.get(&project_id) {
                    Some(s) => s.presence.read().await.all_idle(now_ms, timeout_ms),
                    None => false,
                };
                if still_idle {
                    sessions.remove(&project_id)
                } else {
                    None
                }
            };
            if let Some(session) = removed {
                let stale: Vec<Uuid> = session.presence.read().await.connection_ids();
                let mut connections = self.connections.write().await;
                for connection_id in stale {
                    connections.remove(&connection_id);
                }
                evicted += 1;
                log::info!("project {project_id} session evicted (idle)");
            }
        }
        evicted
    }

    /// Start the periodic idle sweep. The returned handle aborts the
    /// task when dropped, tying the sweep to the owner's lifecycle.
    pub fn spawn_sweeper(self: Arc<Self>) -> SweeperHandle {
        let registry = self;
        let interval = registry.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.sweep(unix_millis()).await;
                if evicted > 0 {
                    log::info!("idle sweep evicted {evicted} session(s)");
                }
            }
        });
        SweeperHandle { handle }
    }

    /// Insert a participant, creating the session on first join. The
    /// presence insert happens while the sessions map lock is held, so a
    /// concurrent teardown (which re-checks emptiness under the map's
    /// write lock) can never remove the session out from under a joiner.
    async fn insert_participant(
        &self,
        project_id: &str,
        participant: Participant,
    ) -> (Arc<ProjectSession>, bool) {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(project_id) {
                let rejoined = session.presence.write().await.add(participant).is_some();
                return (session.clone(), rejoined);
            }
        }
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(project_id.to_string())
            .or_insert_with(|| {
                log::info!("project {project_id} session created");
                Arc::new(ProjectSession::new())
            })
            .clone();
        let rejoined = session.presence.write().await.add(participant).is_some();
        (session, rejoined)
    }

    async fn get_or_create(&self, project_id: &str) -> Arc<ProjectSession> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(project_id) {
                return session.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(project_id.to_string())
            .or_insert_with(|| {
                log::info!("project {project_id} session created");
                Arc::new(ProjectSession::new())
            })
            .clone()
    }

    async fn snapshot(&self, session: &ProjectSession) -> SessionSnapshot {
        let users = session.presence.read().await.entries();
        let docs = session.documents.read().await;
        let mut documents = Vec::with_capacity(docs.len());
        for (id, doc) in docs.iter() {
            documents.push(doc.lock().await.snapshot(id));
        }
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        SessionSnapshot { users, documents }
    }
}

/// Owns the background sweep task; aborts it on drop.
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
