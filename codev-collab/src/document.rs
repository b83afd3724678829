//! Per-document authoritative state: content, version counter, and a
//! bounded operation log.
//!
//! A `DocumentState` is exclusively owned by its session registry entry
//! and mutated only through the serialized submit path (one
//! `tokio::sync::Mutex` per document, held for the in-memory
//! transform-and-apply step only). The version increases by exactly 1 per
//! applied operation and is never decremented or skipped; rejected
//! submissions leave the document untouched.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::ConflictReason;
use crate::transform::{apply, transform, Payload};

/// How many logged operations to retain for transforming stale
/// submissions, and for how long.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_entries: usize,
    pub max_age_ms: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries: 200,
            max_age_ms: 10 * 60 * 1000,
        }
    }
}

/// An applied operation, immutable once logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOperation {
    /// Server-assigned version this operation produced.
    pub version: u64,
    /// Client-declared base version.
    pub base_version: u64,
    /// Originating participant identifier (user id).
    pub user_id: String,
    /// The payload as applied (post-transformation).
    pub payload: Payload,
    pub timestamp_ms: u64,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub version: u64,
    pub content: String,
    /// The operation as actually applied, for broadcast to other
    /// participants (transformed if the base was stale).
    pub payload: Payload,
}

/// Snapshot of a document for the join reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub id: String,
    pub content: String,
    pub version: u64,
}

/// Authoritative content + version + operation log for one document.
#[derive(Debug)]
pub struct DocumentState {
    content: String,
    version: u64,
    log: VecDeque<LoggedOperation>,
    retention: RetentionPolicy,
}

impl DocumentState {
    /// Empty document at version 0.
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            content: String::new(),
            version: 0,
            log: VecDeque::new(),
            retention,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn snapshot(&self, id: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            id: id.to_string(),
            content: self.content.clone(),
            version: self.version,
        }
    }

    /// Submit an operation declared against `base_version`.
    ///
    /// - `base == current`: applied directly.
    /// - `base < current`: transformed against every logged operation in
    ///   `(base, current]`, ascending, then applied. If the log no longer
    ///   covers `base`, the submission is rejected as stale.
    /// - `base > current`: rejected; a client ahead of the server is a
    ///   desync and must never be silently accepted.
    pub fn submit(
        &mut self,
        base_version: u64,
        payload: Payload,
        user_id: &str,
        now_ms: u64,
    ) -> Result<Applied, ConflictReason> {
        if base_version > self.version {
            return Err(ConflictReason::FutureVersion {
                client_version: base_version,
                current_version: self.version,
            });
        }

        let effective = if base_version == self.version {
            payload
        } else {
            self.transform_stale(base_version, payload, user_id)?
        };

        let new_content = match &effective {
            // Lossy fallback: full replacement is last-write-wins against
            // the transformed base.
            Payload::Replace { content } => content.clone(),
            Payload::Patch { edit } => apply(&self.content, edit)?,
        };

        self.content = new_content;
        self.version += 1;
        self.log.push_back(LoggedOperation {
            version: self.version,
            base_version,
            user_id: user_id.to_string(),
            payload: effective.clone(),
            timestamp_ms: now_ms,
        });
        self.evict(now_ms);

        Ok(Applied {
            version: self.version,
            content: self.content.clone(),
            payload: effective,
        })
    }

    /// Transform a stale payload against every logged operation newer
    /// than its base, in ascending version order.
    fn transform_stale(
        &self,
        base_version: u64,
        payload: Payload,
        user_id: &str,
    ) -> Result<Payload, ConflictReason> {
        let oldest = match self.log.front() {
            Some(op) => op.version,
            None => {
                return Err(ConflictReason::StaleVersion {
                    client_version: base_version,
                    oldest_retained: self.version,
                })
            }
        };
        // Every version in (base, current] must still be logged.
        if base_version + 1 < oldest {
            return Err(ConflictReason::StaleVersion {
                client_version: base_version,
                oldest_retained: oldest,
            });
        }

        let mut edit = match payload {
            // Replacement carries no positions to adjust; it wins over
            // whatever the intervening operations produced.
            replace @ Payload::Replace { .. } => return Ok(replace),
            Payload::Patch { edit } => edit,
        };
        for op in self.log.iter().filter(|op| op.version > base_version) {
            let against = match &op.payload {
                Payload::Patch { edit } => edit,
                // A logged full replacement invalidates positional
                // context entirely; nothing sensible to transform against.
                Payload::Replace { .. } => {
                    return Err(ConflictReason::StaleVersion {
                        client_version: base_version,
                        oldest_retained: op.version,
                    })
                }
            };
            edit = transform(&edit, user_id, against, &op.user_id);
        }
        Ok(Payload::Patch { edit })
    }

    fn evict(&mut self, now_ms: u64) {
        while self.log.len() > self.retention.max_entries {
            self.log.pop_front();
        }
        let cutoff = now_ms.saturating_sub(self.retention.max_age_ms);
        while self
            .log
            .front()
            .is_some_and(|op| op.timestamp_ms < cutoff)
        {
            self.log.pop_front();
        }
    }
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}
