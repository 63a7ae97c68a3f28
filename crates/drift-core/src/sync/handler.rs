//! Replay strategy wiring the operation queue to the sync API

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::{RemoteSyncClient, UploadOutcome};
use crate::db::{
    ConflictRepository, Database, SqliteConflictRepository, SqliteVersionRepository,
    VersionRepository,
};
use crate::error::Result;
use crate::models::{
    DeletePayload, DocumentPayload, LocalVersionRecord, MovePayload, OperationKind,
    PendingOperation,
};
use crate::queue::OperationHandler;

/// Applies queued operations through the same upload path the coordinator
/// uses online: accepted writes update the version ledger, conflicts become
/// durable conflict records.
pub struct SyncOperationHandler {
    client: Arc<RemoteSyncClient>,
    db: Arc<Database>,
}

impl SyncOperationHandler {
    /// Create a handler sharing the engine's client and database
    pub const fn new(client: Arc<RemoteSyncClient>, db: Arc<Database>) -> Self {
        Self { client, db }
    }

    /// Upload a snapshot and record the outcome.
    ///
    /// A conflict returns `Ok`: the durable conflict record supersedes the
    /// queued operation, and retrying the identical stale write would
    /// conflict forever.
    async fn push_document(
        &self,
        path: &str,
        content: &str,
        sidecar: &str,
        base_version: Option<i64>,
    ) -> Result<()> {
        match self
            .client
            .upload_document(path, content, sidecar, base_version)
            .await?
        {
            UploadOutcome::Accepted(document) => {
                let now = chrono::Utc::now().timestamp_millis();
                self.db.with_conn(|conn| {
                    SqliteVersionRepository::new(conn).upsert(&LocalVersionRecord {
                        path: path.to_string(),
                        content_hash: document.content_hash.clone(),
                        sidecar_hash: document.sidecar_hash.clone(),
                        version: document.version,
                        last_synced_at: now,
                        pending_upload: false,
                    })
                })?;
                debug!(path, version = document.version, "replayed upload accepted");
                Ok(())
            }
            UploadOutcome::Conflict(conflict) => {
                let record = conflict.into_record(chrono::Utc::now().timestamp_millis());
                warn!(
                    path,
                    local = record.local_version,
                    remote = record.remote_version,
                    "replayed upload hit a version conflict"
                );
                self.db
                    .with_conn(|conn| SqliteConflictRepository::new(conn).upsert(&record))?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl OperationHandler for SyncOperationHandler {
    async fn apply(&self, operation: &PendingOperation) -> Result<()> {
        match operation.kind {
            OperationKind::Create | OperationKind::Update => {
                let payload: DocumentPayload = serde_json::from_value(operation.payload.clone())?;
                self.push_document(
                    &operation.path,
                    &payload.content,
                    &payload.sidecar,
                    payload.base_version,
                )
                .await
            }
            OperationKind::Delete => {
                let payload: DeletePayload = serde_json::from_value(operation.payload.clone())?;
                let receipt = self.client.delete_document(&payload.document_id).await?;
                debug!(
                    path = %operation.path,
                    deleted_at = receipt.deleted_at,
                    "replayed delete accepted"
                );
                Ok(())
            }
            OperationKind::Rename | OperationKind::Move => {
                // No move endpoint on the wire: upload at the target path
                // first so the content stays reachable, then tombstone the
                // source when it was ever synced.
                let payload: MovePayload = serde_json::from_value(operation.payload.clone())?;
                self.push_document(&payload.to, &payload.content, &payload.sidecar, None)
                    .await?;
                if let Some(document_id) = &payload.document_id {
                    self.client.delete_document(document_id).await?;
                }
                Ok(())
            }
        }
    }
}
