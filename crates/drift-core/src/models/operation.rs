//! Pending operation model for the durable queue

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// A unique identifier for a queued operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The mutation a queued operation replays against the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// First upload of a new path
    Create,
    /// Upload of an existing path
    Update,
    /// Soft delete of a remote document
    Delete,
    /// Rename within the same directory
    Rename,
    /// Move to a different directory
    Move,
}

impl OperationKind {
    /// Stable string form used for persistence
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::Move => "move",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "rename" => Ok(Self::Rename),
            "move" => Ok(Self::Move),
            other => Err(Error::InvalidInput(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// A mutation that could not be applied immediately, persisted until replay.
///
/// Owned exclusively by the operation queue. Destroyed on successful replay;
/// retained with an incremented `retry_count` on failure; skipped (but never
/// deleted) once `retry_count` reaches the ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique identifier
    pub id: OperationId,
    /// Mutation kind
    pub kind: OperationKind,
    /// Workspace-relative path the mutation applies to
    pub path: String,
    /// Opaque serialized payload, decoded by the replay handler
    pub payload: serde_json::Value,
    /// Enqueue timestamp (Unix ms); replay order is ascending on this
    pub created_at: i64,
    /// Number of failed replay attempts
    pub retry_count: u32,
    /// Error message from the most recent failed attempt
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Create a new pending operation with the given payload
    #[must_use]
    pub fn new(kind: OperationKind, path: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            path: path.into(),
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Payload for `create`/`update` operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    /// Document content at enqueue time
    pub content: String,
    /// Sidecar metadata at enqueue time
    pub sidecar: String,
    /// Last version this device observed; `None` signals a first upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
}

/// Payload for `delete` operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePayload {
    /// Server id of the document to tombstone
    pub document_id: String,
}

/// Payload for `rename`/`move` operations.
///
/// The wire contract has no move endpoint, so replay uploads the snapshot at
/// the target path and then soft-deletes the source document when its id is
/// known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    /// Target workspace-relative path
    pub to: String,
    /// Document content at enqueue time
    pub content: String,
    /// Sidecar metadata at enqueue time
    pub sidecar: String,
    /// Server id of the source document, when it was ever synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}
