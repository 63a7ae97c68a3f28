//! Sync coordinator: orchestrates reconciliation cycles between the local
//! version ledger and the remote document store.
//!
//! One coordinator instance per workspace, constructed on workspace open and
//! torn down on close; nothing here is global. Sync passes are single-flight
//! and never propagate errors to their callers — failures degrade to
//! observable state (`last_error`), because the callers are background timers
//! and UI handlers that must not crash on a network blip.

mod handler;

pub use handler::SyncOperationHandler;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{has_local_changes, AuthProvider, RemoteStatus, RemoteSyncClient, UploadOutcome};
use crate::db::{
    ConflictRepository, Database, SqliteConflictRepository, SqliteVersionRepository,
    VersionRepository,
};
use crate::error::Result;
use crate::models::{
    is_local_conflict_id, ConflictResolution, DocumentPayload, DocumentSnapshot,
    LocalVersionRecord, OperationKind, RemoteDocument, SyncConflict, SyncDocument, SyncUsage,
};
use crate::queue::OperationQueue;

/// Coordinator state machine: a sync pass is either running or not
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No reconciliation pass in progress
    #[default]
    Idle,
    /// A reconciliation pass is running
    Syncing,
}

/// Observable snapshot of the engine's health, for status indicators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Current state machine position
    pub state: SyncState,
    /// Operations awaiting replay (below the retry ceiling)
    pub pending_operations: usize,
    /// Whether any conflict awaits resolution
    pub has_conflicts: bool,
    /// The conflict most recently surfaced by a rejected upload
    pub active_conflict: Option<String>,
    /// Timestamp of the last successful sync pass (Unix ms)
    pub last_synced_at: Option<i64>,
    /// Most recent recorded failure, cleared on success
    pub last_error: Option<String>,
}

/// Read-only mirror of remote state plus sync bookkeeping.
///
/// Replaced wholesale on every successful pull; never merged, since the
/// server is authoritative for everything in it.
#[derive(Default)]
struct RemoteMirror {
    documents: HashMap<String, SyncDocument>,
    usage: Option<SyncUsage>,
    last_synced_at: Option<i64>,
    last_error: Option<String>,
    active_conflict: Option<String>,
}

/// Orchestrates pull/push reconciliation and the conflict lifecycle for one
/// workspace. Sole mutator of the version ledger and the conflict set.
pub struct SyncCoordinator {
    client: Arc<RemoteSyncClient>,
    db: Arc<Database>,
    queue: Arc<OperationQueue>,
    auth: Arc<dyn AuthProvider>,
    online: watch::Receiver<bool>,
    sync_in_flight: AtomicBool,
    mirror: Mutex<RemoteMirror>,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncCoordinator {
    /// Create a coordinator for one workspace.
    ///
    /// `online` is the host-owned connectivity signal; the coordinator only
    /// reads it.
    pub fn new(
        client: Arc<RemoteSyncClient>,
        db: Arc<Database>,
        queue: Arc<OperationQueue>,
        auth: Arc<dyn AuthProvider>,
        online: watch::Receiver<bool>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let coordinator = Self {
            client,
            db,
            queue,
            auth,
            online,
            sync_in_flight: AtomicBool::new(false),
            mirror: Mutex::new(RemoteMirror::default()),
            status_tx,
        };
        coordinator.publish_status();
        coordinator
    }

    /// Whether the connectivity signal currently reads online
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Run one reconciliation pass against the remote.
    ///
    /// No-op (returns false) when offline, unauthenticated, or when a pass is
    /// already in flight. Failures are recorded, never propagated.
    pub async fn perform_sync(&self) -> bool {
        if !self.auth.is_authenticated() || !self.is_online() {
            debug!("skipping sync pass; offline or unauthenticated");
            return false;
        }
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync pass already in progress");
            return false;
        }
        self.publish_status();

        let outcome = self.pull_remote().await;
        self.sync_in_flight.store(false, Ordering::SeqCst);

        let synced = match outcome {
            Ok(()) => {
                let mut mirror = self.mirror_lock();
                mirror.last_synced_at = Some(chrono::Utc::now().timestamp_millis());
                mirror.last_error = None;
                drop(mirror);
                debug!("sync pass completed");
                true
            }
            Err(error) => {
                warn!(%error, "sync pass failed");
                self.mirror_lock().last_error = Some(error.to_string());
                false
            }
        };

        self.publish_status();
        synced
    }

    /// Upload a document snapshot.
    ///
    /// Offline or unauthenticated, the snapshot is queued for replay and the
    /// call returns false immediately — it never blocks on connectivity.
    /// Online, an accepted write updates the version ledger; a rejection
    /// becomes a durable conflict; any other failure re-queues the snapshot
    /// so transient errors retry without user involvement.
    pub async fn upload_document(
        &self,
        snapshot: &DocumentSnapshot,
        base_version: Option<i64>,
    ) -> bool {
        if !self.auth.is_authenticated() || !self.is_online() {
            match self.enqueue_snapshot(snapshot, base_version) {
                Ok(()) => debug!(path = %snapshot.path, "queued upload for later replay"),
                Err(error) => {
                    warn!(path = %snapshot.path, %error, "failed to queue offline upload");
                    self.mirror_lock().last_error = Some(error.to_string());
                }
            }
            self.publish_status();
            return false;
        }

        self.set_pending_upload(&snapshot.path, true);
        self.publish_status();

        let uploaded = self
            .client
            .upload_document(
                &snapshot.path,
                &snapshot.content,
                &snapshot.sidecar,
                base_version,
            )
            .await;

        let accepted = match uploaded {
            Ok(UploadOutcome::Accepted(document)) => {
                if let Err(error) = self.remember_synced(&snapshot.path, &document) {
                    warn!(path = %snapshot.path, %error, "failed to update version ledger");
                }
                let mut mirror = self.mirror_lock();
                mirror.documents.insert(document.path.clone(), document);
                mirror.last_error = None;
                drop(mirror);
                debug!(path = %snapshot.path, "upload accepted");
                true
            }
            Ok(UploadOutcome::Conflict(conflict)) => {
                let record = conflict.into_record(chrono::Utc::now().timestamp_millis());
                warn!(
                    path = %snapshot.path,
                    local = record.local_version,
                    remote = record.remote_version,
                    "upload rejected with a version conflict"
                );
                if let Err(error) = self.db.with_conn(|conn| {
                    SqliteConflictRepository::new(conn).upsert(&record)?;
                    SqliteVersionRepository::new(conn).set_pending_upload(&snapshot.path, false)
                }) {
                    warn!(path = %snapshot.path, %error, "failed to persist conflict record");
                }
                self.mirror_lock().active_conflict = Some(record.id);
                false
            }
            Err(error) => {
                warn!(path = %snapshot.path, %error, "upload failed; queueing for retry");
                self.set_pending_upload(&snapshot.path, false);
                self.mirror_lock().last_error = Some(error.to_string());
                if let Err(enqueue_error) = self.enqueue_snapshot(snapshot, base_version) {
                    warn!(path = %snapshot.path, %enqueue_error, "failed to queue upload retry");
                }
                false
            }
        };

        self.publish_status();
        accepted
    }

    /// Apply a user-chosen resolution.
    ///
    /// The conflict is only removed locally after the server confirms; on
    /// failure it stays active and the error is surfaced.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> bool {
        // A placeholder id from an id-less 409 means nothing to the server;
        // the next sync pass fetches its record for the same conflict.
        if is_local_conflict_id(conflict_id) {
            warn!(conflict_id, "conflict id was minted locally; sync to obtain the server's record");
            self.mirror_lock().last_error =
                Some("conflict is not yet known to the server; run a sync pass first".to_string());
            self.publish_status();
            return false;
        }

        match self.client.resolve_conflict(conflict_id, resolution).await {
            Ok(receipt) => {
                if let Err(error) = self
                    .db
                    .with_conn(|conn| SqliteConflictRepository::new(conn).mark_resolved(conflict_id))
                {
                    warn!(conflict_id, %error, "failed to mark conflict resolved locally");
                }
                let mut mirror = self.mirror_lock();
                if mirror.active_conflict.as_deref() == Some(conflict_id) {
                    mirror.active_conflict = None;
                }
                drop(mirror);
                info!(conflict_id, resolution = %receipt.resolution, "conflict resolved");
                self.publish_status();
                // Reconcile so the mirror reflects the post-resolution remote
                self.perform_sync().await;
                true
            }
            Err(error) => {
                warn!(conflict_id, %error, "conflict resolution failed");
                self.mirror_lock().last_error = Some(error.to_string());
                self.publish_status();
                false
            }
        }
    }

    /// Cheap pre-upload check: does this content differ from the cached
    /// remote state for the path? True when no remote document exists.
    pub fn needs_sync(&self, path: &str, content: &str) -> bool {
        self.mirror_lock()
            .documents
            .get(path)
            .map_or(true, |document| {
                has_local_changes(content, &document.content_hash)
            })
    }

    /// Cached remote document for a path, if the last pull saw one
    pub fn cached_document(&self, path: &str) -> Option<SyncDocument> {
        self.mirror_lock().documents.get(path).cloned()
    }

    /// Unresolved conflicts awaiting user attention
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.unresolved_conflicts()
    }

    /// Usage aggregate from the last pull
    pub fn usage(&self) -> Option<SyncUsage> {
        self.mirror_lock().usage.clone()
    }

    /// Fetch usage from the server and cache it
    pub async fn refresh_usage(&self) -> Result<SyncUsage> {
        let usage = self.client.get_usage().await?;
        self.mirror_lock().usage = Some(usage.clone());
        Ok(usage)
    }

    /// Download a remote document and refresh the version ledger for its
    /// path, so a follow-up save of the returned content doesn't look dirty.
    ///
    /// Used when applying a `remote` resolution: the caller writes the
    /// returned content through its own storage adapter.
    pub async fn fetch_remote_document(&self, document_id: &str) -> Result<RemoteDocument> {
        let document = self.client.download_document(document_id).await?;
        let now = chrono::Utc::now().timestamp_millis();
        self.db.with_conn(|conn| {
            SqliteVersionRepository::new(conn).upsert(&LocalVersionRecord {
                path: document.path.clone(),
                content_hash: document.content_hash.clone(),
                sidecar_hash: document.sidecar_hash.clone(),
                version: document.version,
                last_synced_at: now,
                pending_upload: false,
            })
        })?;
        Ok(document)
    }

    /// Full reset: drop the version ledger and the remote mirror.
    ///
    /// The only path that ever deletes version records.
    pub fn reset(&self) -> Result<()> {
        self.db
            .with_conn(|conn| SqliteVersionRepository::new(conn).clear())?;
        let mut mirror = self.mirror_lock();
        *mirror = RemoteMirror::default();
        drop(mirror);
        self.publish_status();
        Ok(())
    }

    /// Current status snapshot
    pub fn status(&self) -> SyncStatus {
        self.compute_status()
    }

    /// Observable status signal for UI indicators
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    async fn pull_remote(&self) -> Result<()> {
        let RemoteStatus {
            documents,
            conflicts,
            usage,
        } = self.client.get_status().await?;

        // Reconcile durable conflict records with the server's set. The
        // server's report only speaks for ids it assigned: a server-assigned
        // record it no longer lists was resolved elsewhere, but a
        // locally-minted record (id-less 409) is unknown to it by
        // construction and must survive until the server reports its own
        // record for the same document, which supersedes it.
        let swept = self.db.with_conn(|conn| {
            let repo = SqliteConflictRepository::new(conn);
            let known = repo.list_unresolved()?;
            for conflict in &conflicts {
                repo.upsert(conflict)?;
            }
            let fresh_ids: HashSet<&str> = conflicts.iter().map(|c| c.id.as_str()).collect();
            let fresh_documents: HashSet<&str> =
                conflicts.iter().map(|c| c.document_id.as_str()).collect();
            let mut swept = Vec::new();
            for stale in known {
                if fresh_ids.contains(stale.id.as_str()) {
                    continue;
                }
                if stale.has_server_id() || fresh_documents.contains(stale.document_id.as_str()) {
                    repo.mark_resolved(&stale.id)?;
                    swept.push(stale.id);
                }
            }
            Ok(swept)
        })?;

        let mut mirror = self.mirror_lock();
        mirror.documents = documents
            .into_iter()
            .map(|document| (document.path.clone(), document))
            .collect();
        mirror.usage = Some(usage);
        if let Some(active) = &mirror.active_conflict {
            if swept.iter().any(|id| id == active) {
                mirror.active_conflict = None;
            }
        }

        Ok(())
    }

    fn enqueue_snapshot(
        &self,
        snapshot: &DocumentSnapshot,
        base_version: Option<i64>,
    ) -> Result<()> {
        let kind = if base_version.is_some() {
            OperationKind::Update
        } else {
            OperationKind::Create
        };
        let payload = serde_json::to_value(DocumentPayload {
            content: snapshot.content.clone(),
            sidecar: snapshot.sidecar.clone(),
            base_version,
        })?;
        self.queue.enqueue(kind, &snapshot.path, payload)?;
        Ok(())
    }

    fn remember_synced(&self, path: &str, document: &SyncDocument) -> Result<()> {
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
        })
    }

    fn set_pending_upload(&self, path: &str, pending: bool) {
        if let Err(error) = self
            .db
            .with_conn(|conn| SqliteVersionRepository::new(conn).set_pending_upload(path, pending))
        {
            warn!(path, %error, "failed to update pending-upload flag");
        }
    }

    fn unresolved_conflicts(&self) -> Vec<SyncConflict> {
        self.db
            .with_conn(|conn| SqliteConflictRepository::new(conn).list_unresolved())
            .unwrap_or_else(|error| {
                warn!(%error, "failed to list conflicts");
                Vec::new()
            })
    }

    fn compute_status(&self) -> SyncStatus {
        let has_conflicts = !self.unresolved_conflicts().is_empty();
        let mirror = self.mirror_lock();
        SyncStatus {
            state: if self.sync_in_flight.load(Ordering::SeqCst) {
                SyncState::Syncing
            } else {
                SyncState::Idle
            },
            pending_operations: self.queue.pending_len(),
            has_conflicts,
            active_conflict: mirror.active_conflict.clone(),
            last_synced_at: mirror.last_synced_at,
            last_error: mirror.last_error.clone(),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.compute_status());
    }

    fn mirror_lock(&self) -> MutexGuard<'_, RemoteMirror> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn seed_remote_document(&self, document: SyncDocument) {
        self.mirror_lock()
            .documents
            .insert(document.path.clone(), document);
    }
}

/// Minimal canned-response HTTP listener for exercising online paths in
/// tests without a real server. Serves one connection per response, in
/// order, and captures the raw requests.
#[cfg(test)]
pub(crate) mod stub_server {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    pub struct StubServer {
        pub endpoint: String,
        handle: thread::JoinHandle<Vec<String>>,
    }

    impl StubServer {
        pub fn serve(responses: Vec<String>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let endpoint = format!("http://{}", listener.local_addr().unwrap());
            let handle = thread::spawn(move || {
                let mut captured = Vec::new();
                for response in responses {
                    let Ok((mut stream, _)) = listener.accept() else {
                        break;
                    };
                    captured.push(read_request(&mut stream));
                    stream.write_all(response.as_bytes()).unwrap();
                }
                captured
            });
            Self { endpoint, handle }
        }

        /// Wait until every response has been consumed; returns the raw
        /// requests in arrival order.
        pub fn finish(self) -> Vec<String> {
            self.handle.join().unwrap()
        }
    }

    pub fn json_response(status: u16, reason: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status} {reason}\r\n\
             content-type: application/json\r\n\
             content-length: {}\r\n\
             connection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn read_request(stream: &mut TcpStream) -> String {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = stream.read(&mut chunk).unwrap();
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(headers_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buffer[..headers_end]);
                let content_length = headers
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|value| value.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buffer.len() >= headers_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buffer).to_string()
    }
}
