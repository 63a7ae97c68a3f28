//! Conflict models: the durable conflict record, the 409 payload attached to
//! a rejected upload, and the user-chosen resolution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Prefix for conflict ids minted locally from an id-less 409 payload.
///
/// Placeholder ids are unusable against the resolve endpoint; the record
/// survives until the server reports its own record for the same document.
const LOCAL_ID_PREFIX: &str = "local-";

/// Whether a conflict id was minted locally rather than assigned by the server
#[must_use]
pub fn is_local_conflict_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// A detected version divergence between local and remote state for one
/// document. Created the instant a write is rejected for a stale base
/// version; marked resolved only after the server confirms a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Conflict identifier
    pub id: String,
    /// Server id of the conflicted document
    pub document_id: String,
    /// Workspace-relative path
    pub path: String,
    /// Version this device last observed as synced
    pub local_version: i64,
    /// Current server version that rejected the write
    pub remote_version: i64,
    /// Detection timestamp (Unix ms)
    pub created_at: i64,
    /// Whether a resolution has completed against the remote
    #[serde(default)]
    pub resolved: bool,
}

impl SyncConflict {
    /// Whether this conflict's id came from the server and is therefore
    /// usable against the resolve endpoint
    #[must_use]
    pub fn has_server_id(&self) -> bool {
        !is_local_conflict_id(&self.id)
    }
}

/// Conflict payload attached to a rejected upload (HTTP 409).
///
/// Carries the remote content so the UI can diff without a second
/// round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConflict {
    /// Conflict id assigned by the server, when it recorded one
    #[serde(default)]
    pub id: Option<String>,
    /// Server id of the conflicted document
    pub document_id: String,
    /// Workspace-relative path
    pub path: String,
    /// The stale base version the client supplied
    pub local_version: i64,
    /// Current server version
    pub remote_version: i64,
    /// Remote content at `remote_version`
    pub remote_content: String,
    /// Remote sidecar at `remote_version`
    #[serde(default)]
    pub remote_sidecar: String,
}

impl UploadConflict {
    /// Turn the wire payload into a durable conflict record, minting a
    /// marked placeholder id when the server did not supply one.
    #[must_use]
    pub fn into_record(self, created_at: i64) -> SyncConflict {
        SyncConflict {
            id: self
                .id
                .unwrap_or_else(|| format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7())),
            document_id: self.document_id,
            path: self.path,
            local_version: self.local_version,
            remote_version: self.remote_version,
            created_at,
            resolved: false,
        }
    }
}

/// One side of a conflict as returned by `GET /conflicts/:id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSide {
    /// Content on this side
    pub content: String,
    /// Version on this side
    pub version: i64,
}

/// Full conflict detail returned by `GET /conflicts/:id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    /// Conflict identifier
    pub id: String,
    /// Server id of the conflicted document
    pub document_id: String,
    /// Workspace-relative path
    pub path: String,
    /// The local (rejected) side
    pub local: ConflictSide,
    /// The remote (authoritative) side
    pub remote: ConflictSide,
    /// Detection timestamp (Unix ms)
    pub created_at: i64,
    /// Whether the conflict has been resolved
    #[serde(default)]
    pub resolved: bool,
}

/// User-chosen conflict resolution, always applied via a server round-trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Force-overwrite remote with local content
    Local,
    /// Discard local edits and apply remote content
    Remote,
    /// Keep local content as a conflicted copy under a derived path
    Both,
}

impl ConflictResolution {
    /// Stable string form used on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "both" => Ok(Self::Both),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict resolution: {other}"
            ))),
        }
    }
}

/// Server confirmation of a completed resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReceipt {
    /// The resolution that was applied
    pub resolution: ConflictResolution,
    /// When the server applied it (Unix ms)
    pub resolved_at: i64,
}
