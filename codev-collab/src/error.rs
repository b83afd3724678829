//! Engine error taxonomy.
//!
//! All document-mutation errors are local to the offending submission and
//! never poison state for other participants. Presence bookkeeping errors
//! (duplicate join, unknown leave) are healed idempotently and never
//! surface here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a submitted operation was rejected.
///
/// Reported directly to the submitting connection as a `version-conflict`
/// event; never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConflictReason {
    /// Client declared a base version ahead of the server's — desync.
    #[error("base version {client_version} is ahead of current version {current_version}")]
    FutureVersion {
        client_version: u64,
        current_version: u64,
    },

    /// Base version predates the retained operation log; the incoming
    /// operation can no longer be transformed.
    #[error("base version {client_version} predates retained history (oldest {oldest_retained})")]
    StaleVersion {
        client_version: u64,
        oldest_retained: u64,
    },

    /// The payload could not be applied (e.g. position past end of text).
    #[error("malformed payload: {detail}")]
    MalformedPayload { detail: String },
}

/// Gateway-level errors, reported to the offending connection as an
/// `error` event. Version conflicts travel separately as
/// [`ConflictReason`] inside `version-conflict`, and save failures as
/// `file-saved` with `success: false`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Referenced project has no live session. Documents auto-heal via
    /// lazy creation; this fires for operations that require membership.
    #[error("no active session for project {0}")]
    NotFound(String),

    /// Undecodable inbound payload. The connection is not dropped.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_reason_serializes_with_tag() {
        let reason = ConflictReason::FutureVersion {
            client_version: 5,
            current_version: 2,
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "futureVersion");
        assert_eq!(json["clientVersion"], 5);
        assert_eq!(json["currentVersion"], 2);
    }

    #[test]
    fn conflict_reason_display() {
        let reason = ConflictReason::StaleVersion {
            client_version: 1,
            oldest_retained: 40,
        };
        let msg = reason.to_string();
        assert!(msg.contains("predates"));
        assert!(msg.contains("40"));
    }

    #[test]
    fn engine_error_display_names_the_project() {
        let err = EngineError::NotFound("p1".into());
        assert!(err.to_string().contains("p1"));
    }
}
