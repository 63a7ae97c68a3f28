//! Document models: the remote-authoritative record, the local version
//! ledger entry, and the snapshot value callers hand to upload paths.

use serde::{Deserialize, Serialize};

/// Remote-authoritative document record, mirrored locally and never mutated
/// by this device. `version` is a monotonic integer incremented by the server
/// on every accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDocument {
    /// Opaque server-assigned identifier
    pub id: String,
    /// Workspace-relative path, unique per user among non-deleted documents
    pub path: String,
    /// Digest of the document content
    pub content_hash: String,
    /// Digest of the sidecar metadata
    pub sidecar_hash: String,
    /// Server version, strictly increasing per document id
    pub version: i64,
    /// Content size in bytes
    pub size_bytes: i64,
    /// Last accepted write timestamp (Unix ms)
    pub updated_at: i64,
    /// Soft-delete tombstone flag
    #[serde(default)]
    pub deleted: bool,
}

/// Last version of a path this device observed as synced.
///
/// Owned exclusively by the coordinator; created on first successful upload,
/// updated on every subsequent sync, deleted only on full reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVersionRecord {
    /// Workspace-relative path
    pub path: String,
    /// Content digest at last sync
    pub content_hash: String,
    /// Sidecar digest at last sync
    pub sidecar_hash: String,
    /// Last server version observed as synced
    pub version: i64,
    /// Timestamp of the last successful sync (Unix ms)
    pub last_synced_at: i64,
    /// An upload for this path is currently in flight
    pub pending_upload: bool,
}

/// The value a caller hands to the upload paths. The engine never reads the
/// filesystem itself; content arrives as an argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    /// Workspace-relative path
    pub path: String,
    /// Document content
    pub content: String,
    /// Sidecar metadata (serialized by the caller)
    pub sidecar: String,
}

impl DocumentSnapshot {
    /// Create a snapshot for upload
    pub fn new(
        path: impl Into<String>,
        content: impl Into<String>,
        sidecar: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            sidecar: sidecar.into(),
        }
    }
}

/// Full document payload returned by `GET /documents/:id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    /// Server-assigned identifier
    pub id: String,
    /// Workspace-relative path
    pub path: String,
    /// Document content
    pub content: String,
    /// Sidecar metadata
    pub sidecar: String,
    /// Content digest
    pub content_hash: String,
    /// Sidecar digest
    pub sidecar_hash: String,
    /// Server version
    pub version: i64,
    /// Last accepted write timestamp (Unix ms)
    pub updated_at: i64,
}

/// Confirmation of a soft delete; the server retains a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReceipt {
    /// When the tombstone was recorded (Unix ms)
    pub deleted_at: i64,
}
