//! External collaborator contracts: file persistence and deployment.
//!
//! The engine never blocks an edit on these; saves run off the document
//! lock with at most one bounded retry, and deployments return a pending
//! record immediately (final status arrives out-of-band and is relayed
//! verbatim through `deployment-update` broadcasts).
//!
//! In-memory implementations live here for wiring tests and local runs;
//! the real services (database-backed file store, build pipeline) are
//! separate processes behind these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("project {0} not found")]
    NotFound(String),
    #[error("user {user_id} is not a member of project {project_id}")]
    PermissionDenied { project_id: String, user_id: String },
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Which logical slot of a project a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    Frontend,
    Backend,
    Mock,
}

impl FileType {
    /// Document ids are logical names ("frontend", "backend", "mock"),
    /// not storage paths; unrecognized names default to frontend, the
    /// same default the file store applies.
    pub fn for_document(document_id: &str) -> Self {
        match document_id {
            "backend" => FileType::Backend,
            "mock" => FileType::Mock,
            _ => FileType::Frontend,
        }
    }
}

/// Record returned by a successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedFile {
    pub id: Uuid,
    pub project_id: String,
    pub path: String,
    pub file_type: FileType,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Success,
    Failed,
}

/// Pending deployment record; final status is delivered out-of-band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: String,
    pub status: DeploymentStatus,
    pub config: serde_json::Value,
}

#[async_trait]
pub trait FileService: Send + Sync {
    /// Persist document content. `NotFound` for unknown projects,
    /// `PermissionDenied` when the caller lacks membership.
    async fn save_file(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
        user_id: &str,
        file_type: FileType,
    ) -> Result<SavedFile, ServiceError>;
}

#[async_trait]
pub trait DeployService: Send + Sync {
    /// Kick off a deployment; returns immediately with a pending record.
    async fn deploy_project(
        &self,
        project_id: &str,
        config: serde_json::Value,
        user_id: &str,
    ) -> Result<Deployment, ServiceError>;
}

/// In-memory file store. Saves everything; optionally primed to fail a
/// number of calls so retry behavior can be exercised.
#[derive(Default)]
pub struct InMemoryFileService {
    files: Mutex<HashMap<(String, String), String>>,
    fail_remaining: Mutex<u32>,
}

impl InMemoryFileService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` save calls fail with `Unavailable`.
    pub async fn fail_next(&self, n: u32) {
        *self.fail_remaining.lock().await = n;
    }

    pub async fn saved_content(&self, project_id: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .await
            .get(&(project_id.to_string(), path.to_string()))
            .cloned()
    }

    pub async fn save_count(&self) -> usize {
        self.files.lock().await.len()
    }
}

#[async_trait]
impl FileService for InMemoryFileService {
    async fn save_file(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
        _user_id: &str,
        file_type: FileType,
    ) -> Result<SavedFile, ServiceError> {
        {
            let mut remaining = self.fail_remaining.lock().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ServiceError::Unavailable("simulated outage".into()));
            }
        }
        self.files
            .lock()
            .await
            .insert((project_id.to_string(), path.to_string()), content.to_string());
        Ok(SavedFile {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            path: path.to_string(),
            file_type,
            updated_at_ms: crate::registry::unix_millis(),
        })
    }
}

/// Deploy service double: records requests, returns pending records.
#[derive(Default)]
pub struct InMemoryDeployService {
    requests: Mutex<Vec<(String, String)>>,
    reject_unknown: Mutex<Option<String>>,
}

impl InMemoryDeployService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `project_id` as unknown, returning `NotFound` for it.
    pub async fn reject_project(&self, project_id: &str) {
        *self.reject_unknown.lock().await = Some(project_id.to_string());
    }

    pub async fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl DeployService for InMemoryDeployService {
    async fn deploy_project(
        &self,
        project_id: &str,
        config: serde_json::Value,
        user_id: &str,
    ) -> Result<Deployment, ServiceError> {
        if self.reject_unknown.lock().await.as_deref() == Some(project_id) {
            return Err(ServiceError::NotFound(project_id.to_string()));
        }
        self.requests
            .lock()
            .await
            .push((project_id.to_string(), user_id.to_string()));
        Ok(Deployment {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            status: DeploymentStatus::Pending,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_from_document_id() {
        assert_eq!(FileType::for_document("frontend"), FileType::Frontend);
        assert_eq!(FileType::for_document("backend"), FileType::Backend);
        assert_eq!(FileType::for_document("mock"), FileType::Mock);
        assert_eq!(FileType::for_document("anything"), FileType::Frontend);
    }

    #[tokio::test]
    async fn in_memory_save_and_read_back() {
        let svc = InMemoryFileService::new();
        let saved = svc
            .save_file("p1", "frontend", "const x=1;", "u1", FileType::Frontend)
            .await
            .unwrap();
        assert_eq!(saved.project_id, "p1");
        assert_eq!(
            svc.saved_content("p1", "frontend").await.as_deref(),
            Some("const x=1;")
        );
    }

    #[tokio::test]
    async fn in_memory_save_failure_injection() {
        let svc = InMemoryFileService::new();
        svc.fail_next(1).await;
        let err = svc
            .save_file("p1", "frontend", "x", "u1", FileType::Frontend)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        // Next call succeeds.
        assert!(svc
            .save_file("p1", "frontend", "x", "u1", FileType::Frontend)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn deploy_returns_pending_record() {
        let svc = InMemoryDeployService::new();
        let deployment = svc
            .deploy_project("p1", serde_json::json!({"target": "local"}), "u1")
            .await
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);
        assert_eq!(svc.requests().await, vec![("p1".into(), "u1".into())]);
    }

    #[tokio::test]
    async fn deploy_unknown_project() {
        let svc = InMemoryDeployService::new();
        svc.reject_project("ghost").await;
        let err = svc
            .deploy_project("ghost", serde_json::Value::Null, "u1")
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::NotFound("ghost".into()));
    }
}
