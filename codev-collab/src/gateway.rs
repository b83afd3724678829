//! WebSocket gateway: accepts connections, decodes client frames into
//! commands, routes them through the session registry, and fans outbound
//! events out to the right subset of connections.
//!
//! ```text
//! Client A ──┐
//!             ├── ConnectionGateway ── SessionRegistry
//! Client B ──┘          │                 │
//!                        │                 ├── PresenceTracker (per project)
//!                        │                 └── DocumentState   (per document,
//!                        │                     serialized submits)
//!                        ├── FileService   (save, off the hot path)
//!                        └── DeployService (fire-and-forget)
//! ```
//!
//! Routing rules: broadcast-style events go to the project's presence
//! list minus the originator; replies and errors go to the originator
//! alone. A connection only ever receives events for the project it has
//! joined. Each connection runs its own task; outbound delivery is a
//! per-connection unbounded channel so one slow socket never stalls the
//! dispatch path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::EngineError;
use crate::presence::Participant;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::{unix_millis, EngineConfig, LeaveOutcome, SessionRegistry};
use crate::services::{DeployService, FileService, FileType};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

/// Command router shared by every connection task.
///
/// Holds the outbound sender for each live connection; all engine state
/// lives in the injected [`SessionRegistry`].
pub struct ConnectionGateway {
    registry: Arc<SessionRegistry>,
    files: Arc<dyn FileService>,
    deploys: Arc<dyn DeployService>,
    connections: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
}

impl ConnectionGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        files: Arc<dyn FileService>,
        deploys: Arc<dyn DeployService>,
    ) -> Self {
        Self {
            registry,
            files,
            deploys,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a connection's outbound channel.
    pub async fn register(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.connections.write().await.insert(connection_id, sender);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Decode and dispatch one inbound frame. Malformed frames earn the
    /// sender a direct `error` event; the connection stays open.
    pub async fn handle(&self, connection_id: Uuid, raw: &str) {
        match ClientEvent::decode(raw) {
            Ok(event) => self.dispatch(connection_id, event).await,
            Err(e) => {
                log::warn!("malformed frame from {connection_id}: {e}");
                self.send_to(
                    connection_id,
                    &ServerEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// Connection closed: leave bookkeeping only. In-flight document
    /// mutations always run to completion.
    pub async fn disconnect(&self, connection_id: Uuid) {
        self.connections.write().await.remove(&connection_id);
        if let Some((project_id, participant, session_closed)) =
            self.registry.disconnect(connection_id).await
        {
            log::info!(
                "connection {connection_id} ({}) disconnected from project {project_id}",
                participant.username
            );
            if !session_closed {
                self.broadcast_to_others(
                    &project_id,
                    connection_id,
                    &ServerEvent::UserLeft {
                        connection_id,
                        username: participant.username,
                    },
                )
                .await;
            }
        }
    }

    async fn dispatch(&self, connection_id: Uuid, event: ClientEvent) {
        match event {
            ClientEvent::JoinProject {
                project_id,
                user_id,
                username,
            } => {
                let now = unix_millis();
                let participant =
                    Participant::new(connection_id, user_id.clone(), username.clone(), now);
                let outcome = self.registry.join(&project_id, participant).await;

                // Re-joining from another project is an implicit leave.
                if let Some(prev) = outcome.previous {
                    if !prev.session_closed {
                        self.broadcast_to_others(
                            &prev.project_id,
                            connection_id,
                            &ServerEvent::UserLeft {
                                connection_id,
                                username: prev.participant.username,
                            },
                        )
                        .await;
                    }
                }

                self.send_to(
                    connection_id,
                    &ServerEvent::ProjectState {
                        users: outcome.snapshot.users,
                        documents: outcome.snapshot.documents,
                    },
                )
                .await;
                self.broadcast_to_others(
                    &project_id,
                    connection_id,
                    &ServerEvent::UserJoined {
                        connection_id,
                        user_id,
                        username,
                    },
                )
                .await;
            }

            ClientEvent::CodeEdit {
                project_id,
                document_id,
                operation,
                version,
                user_id,
            } => {
                let now = unix_millis();
                // Resolved through the live session only, in one step: an
                // edit racing a teardown must never resurrect an empty
                // session.
                let doc = match self.registry.live_document(&project_id, &document_id).await {
                    Some(doc) => doc,
                    None => {
                        self.send_to(
                            connection_id,
                            &ServerEvent::Error {
                                message: EngineError::NotFound(project_id).to_string(),
                            },
                        )
                        .await;
                        return;
                    }
                };
                self.registry.touch(&project_id, connection_id, now).await;
                // The lock covers only the in-memory transform-and-apply
                // step; nothing is awaited while it is held.
                let result = doc.lock().await.submit(version, operation, &user_id, now);
                match result {
                    Ok(applied) => {
                        log::debug!(
                            "document {project_id}/{document_id} at version {}",
                            applied.version
                        );
                        self.broadcast_to_others(
                            &project_id,
                            connection_id,
                            &ServerEvent::CodeUpdated {
                                document_id,
                                operation: applied.payload,
                                version: applied.version,
                                user_id,
                                timestamp: now,
                            },
                        )
                        .await;
                    }
                    Err(reason) => {
                        log::debug!(
                            "edit on {project_id}/{document_id} rejected: {reason}"
                        );
                        self.send_to(
                            connection_id,
                            &ServerEvent::VersionConflict {
                                document_id,
                                conflict: reason,
                            },
                        )
                        .await;
                    }
                }
            }

            ClientEvent::CursorMove {
                project_id,
                document_id,
                position,
                user_id,
            } => {
                let now = unix_millis();
                let known = self
                    .registry
                    .update_cursor(&project_id, connection_id, &document_id, position, now)
                    .await;
                if known {
                    log::trace!("cursor update in {project_id}/{document_id}");
                    self.broadcast_to_others(
                        &project_id,
                        connection_id,
                        &ServerEvent::CursorUpdated {
                            document_id,
                            position,
                            user_id,
                            connection_id,
                        },
                    )
                    .await;
                }
            }

            ClientEvent::SaveFile {
                project_id,
                document_id,
                content,
                user_id,
            } => {
                let now = unix_millis();
                self.registry.touch(&project_id, connection_id, now).await;
                let file_type = FileType::for_document(&document_id);

                // One bounded retry, then the failure is surfaced to the
                // submitter. The in-memory document is unaffected either
                // way; a failed save never rolls back an applied edit.
                let mut attempt = self
                    .files
                    .save_file(&project_id, &document_id, &content, &user_id, file_type)
                    .await;
                if let Err(ref e) = attempt {
                    log::warn!("save of {project_id}/{document_id} failed ({e}), retrying once");
                    attempt = self
                        .files
                        .save_file(&project_id, &document_id, &content, &user_id, file_type)
                        .await;
                }

                let event = match attempt {
                    Ok(_) => {
                        log::info!("document {project_id}/{document_id} saved");
                        ServerEvent::FileSaved {
                            document_id,
                            success: true,
                            error: None,
                            timestamp: unix_millis(),
                        }
                    }
                    Err(e) => {
                        log::error!("save of {project_id}/{document_id} failed: {e}");
                        ServerEvent::FileSaved {
                            document_id,
                            success: false,
                            error: Some(e.to_string()),
                            timestamp: unix_millis(),
                        }
                    }
                };
                self.send_to(connection_id, &event).await;
            }

            ClientEvent::PreviewUpdate {
                project_id,
                frontend_code,
                backend_code,
                mock_data,
            } => {
                let now = unix_millis();
                self.registry.touch(&project_id, connection_id, now).await;
                // Relayed verbatim; no server-side validation.
                self.broadcast_to_others(
                    &project_id,
                    connection_id,
                    &ServerEvent::PreviewChanged {
                        frontend_code,
                        backend_code,
                        mock_data,
                        timestamp: now,
                    },
                )
                .await;
            }

            ClientEvent::DeployRequest {
                project_id,
                user_id,
                deployment_config,
            } => {
                self.registry
                    .touch(&project_id, connection_id, unix_millis())
                    .await;
                match self
                    .deploys
                    .deploy_project(&project_id, deployment_config, &user_id)
                    .await
                {
                    Ok(deployment) => {
                        log::info!(
                            "deployment {} started for project {project_id}",
                            deployment.id
                        );
                        self.send_to(
                            connection_id,
                            &ServerEvent::DeploymentStarted {
                                deployment_id: deployment.id,
                                status: deployment.status,
                            },
                        )
                        .await;
                        self.broadcast_to_others(
                            &project_id,
                            connection_id,
                            &ServerEvent::DeploymentUpdate {
                                deployment_id: deployment.id,
                                status: deployment.status,
                                user_id,
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        log::error!("deployment of project {project_id} failed to start: {e}");
                        self.send_to(
                            connection_id,
                            &ServerEvent::DeploymentError {
                                error: e.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }

            ClientEvent::LeaveProject { project_id } => {
                match self.registry.leave(&project_id, connection_id).await {
                    LeaveOutcome::Removed {
                        participant,
                        session_closed,
                    } => {
                        if !session_closed {
                            self.broadcast_to_others(
                                &project_id,
                                connection_id,
                                &ServerEvent::UserLeft {
                                    connection_id,
                                    username: participant.username,
                                },
                            )
                            .await;
                        }
                    }
                    // Leaving a project you're not in is a no-op.
                    LeaveOutcome::NotFound => {}
                }
            }
        }
    }

    /// Direct reply to one connection.
    async fn send_to(&self, connection_id: Uuid, event: &ServerEvent) {
        let encoded = match event.encode() {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to encode outbound event: {e}");
                return;
            }
        };
        if let Some(tx) = self.connections.read().await.get(&connection_id) {
            if tx.send(encoded).is_err() {
                log::warn!("outbound channel for {connection_id} closed");
            }
        }
    }

    /// Fan an event out to every member of a project except the
    /// originator. The frame is encoded once.
    async fn broadcast_to_others(
        &self,
        project_id: &str,
        originator: Uuid,
        event: &ServerEvent,
    ) {
        let encoded = match event.encode() {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to encode broadcast: {e}");
                return;
            }
        };
        let members = self.registry.connections_in(project_id).await;
        let connections = self.connections.read().await;
        for member in members {
            if member == originator {
                continue;
            }
            if let Some(tx) = connections.get(&member) {
                if tx.send(encoded.clone()).is_err() {
                    log::warn!("outbound channel for {member} closed");
                }
            }
        }
    }
}

/// The collaboration server: registry + gateway + listener.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    gateway: Arc<ConnectionGateway>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        files: Arc<dyn FileService>,
        deploys: Arc<dyn DeployService>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.engine.clone()));
        let gateway = Arc::new(ConnectionGateway::new(registry.clone(), files, deploys));
        Self {
            config,
            registry,
            gateway,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn gateway(&self) -> Arc<ConnectionGateway> {
        self.gateway.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Run the accept loop. The idle sweeper lives exactly as long as
    /// this future.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let _sweeper = self.registry.clone().spawn_sweeper();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_socket(stream, addr, gateway).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Drive one WebSocket connection: inbound frames to the gateway,
/// outbound events from the connection's channel to the socket.
async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<ConnectionGateway>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    gateway.register(connection_id, tx).await;
    log::info!("connection {connection_id} established from {addr}");

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        gateway.handle(connection_id, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("connection {connection_id} closed by peer");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("websocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => ws_sender.send(Message::Text(frame.into())).await?,
                    None => break,
                }
            }
        }
    }

    gateway.disconnect(connection_id).await;
    Ok(())
}
