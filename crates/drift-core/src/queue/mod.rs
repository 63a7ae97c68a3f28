//! Durable operation queue with automatic replay.
//!
//! Mutations that cannot be applied immediately (offline, unauthenticated,
//! transient failure) are persisted here and replayed in enqueue order. One
//! poisoned entry never blocks the rest of the log, and nothing is deleted
//! except on successful replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::db::{Database, QueueRepository, SqliteQueueRepository};
use crate::error::{Error, Result};
use crate::models::{OperationId, OperationKind, PendingOperation};

/// Replay attempts before an operation is parked as stuck.
///
/// Stuck operations are skipped, surfaced via [`OperationQueue::stuck`], and
/// never deleted automatically.
pub const MAX_RETRIES: u32 = 5;

/// Strategy that applies one queued operation against the remote.
///
/// Injected at construction so the queue stays generic over what "replay"
/// means; the sync engine wires in [`crate::sync::SyncOperationHandler`].
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Apply the operation. `Ok(())` removes it from the queue; an error
    /// increments its retry count.
    async fn apply(&self, operation: &PendingOperation) -> Result<()>;
}

/// Handle for a running background processing task.
///
/// Dropping (or calling [`ProcessingHandle::stop`]) aborts the timer and the
/// connectivity listener, so nothing leaks across workspace switches.
pub struct ProcessingHandle {
    task: JoinHandle<()>,
}

impl ProcessingHandle {
    /// Stop periodic processing and release the connectivity subscription
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ProcessingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Durable FIFO store of mutations awaiting remote application
pub struct OperationQueue {
    db: Arc<Database>,
    handler: Arc<dyn OperationHandler>,
    processing: AtomicBool,
    wakeup: Notify,
    pending_tx: watch::Sender<usize>,
}

impl OperationQueue {
    /// Create a queue over the given database with an injected replay handler
    pub fn new(db: Arc<Database>, handler: Arc<dyn OperationHandler>) -> Result<Arc<Self>> {
        let initial = db.with_conn(|conn| SqliteQueueRepository::new(conn).count_active(MAX_RETRIES))?;
        let (pending_tx, _) = watch::channel(initial);
        Ok(Arc::new(Self {
            db,
            handler,
            processing: AtomicBool::new(false),
            wakeup: Notify::new(),
            pending_tx,
        }))
    }

    /// Persist a mutation for later replay.
    ///
    /// Nudges the background processor so the operation is attempted as soon
    /// as a processing task is running and connectivity allows.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<OperationId> {
        let operation = PendingOperation::new(kind, path, payload);
        self.db
            .with_conn(|conn| SqliteQueueRepository::new(conn).insert(&operation))?;
        self.refresh_pending_count();
        self.wakeup.notify_one();
        debug!(id = %operation.id, kind = %kind, path, "queued operation");
        Ok(operation.id)
    }

    /// All persisted operations in replay order. Does not consume.
    pub fn pending(&self) -> Result<Vec<PendingOperation>> {
        self.db
            .with_conn(|conn| SqliteQueueRepository::new(conn).get_pending())
    }

    /// Operations parked at the retry ceiling, still inspectable
    pub fn stuck(&self) -> Result<Vec<PendingOperation>> {
        Ok(self
            .pending()?
            .into_iter()
            .filter(|operation| operation.retry_count >= MAX_RETRIES)
            .collect())
    }

    /// Remove an operation. Succeeds silently if the id is absent.
    pub fn remove(&self, id: &OperationId) -> Result<()> {
        self.db
            .with_conn(|conn| SqliteQueueRepository::new(conn).remove(id))?;
        self.refresh_pending_count();
        Ok(())
    }

    /// Record a failed replay attempt without removing the entry
    pub fn mark_retry(&self, id: &OperationId, error: &str) -> Result<()> {
        self.db
            .with_conn(|conn| SqliteQueueRepository::new(conn).mark_retry(id, error))?;
        self.refresh_pending_count();
        Ok(())
    }

    /// Number of operations still eligible for replay
    pub fn pending_len(&self) -> usize {
        *self.pending_tx.borrow()
    }

    /// Observable pending-count signal for UI indicators
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Replay every eligible operation, in order.
    ///
    /// Single-flight: a pass already in progress makes this a no-op rather
    /// than queueing a second concurrent pass. Failures are isolated per
    /// operation; an unauthenticated state stops the pass without burning
    /// retries, since replay will fail identically for every entry.
    pub async fn process_queue(&self) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("queue processing already in progress");
            return;
        }

        let outcome = self.drain().await;
        self.processing.store(false, Ordering::SeqCst);

        if let Err(error) = outcome {
            warn!(%error, "queue processing pass aborted");
        }
    }

    async fn drain(&self) -> Result<()> {
        let operations = self.pending()?;
        if operations.is_empty() {
            return Ok(());
        }

        debug!(count = operations.len(), "processing queued operations");
        for operation in operations {
            if operation.retry_count >= MAX_RETRIES {
                debug!(id = %operation.id, path = %operation.path, "skipping stuck operation");
                continue;
            }

            match self.handler.apply(&operation).await {
                Ok(()) => {
                    self.remove(&operation.id)?;
                    debug!(id = %operation.id, path = %operation.path, "operation replayed");
                }
                Err(Error::Unauthenticated) => {
                    debug!("not authenticated; leaving queue untouched");
                    break;
                }
                Err(error) => {
                    warn!(id = %operation.id, path = %operation.path, %error, "operation replay failed");
                    self.mark_retry(&operation.id, &error.to_string())?;
                }
            }
        }

        Ok(())
    }

    /// Start periodic processing.
    ///
    /// The task fires on the interval, on every offline→online transition of
    /// `online`, and on enqueue nudges. The returned handle must be stopped
    /// (or dropped) when the workspace closes.
    pub fn start_processing(
        self: &Arc<Self>,
        interval: Duration,
        mut online: watch::Receiver<bool>,
    ) -> ProcessingHandle {
        let queue = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *online.borrow() {
                            queue.process_queue().await;
                        }
                    }
                    changed = online.changed() => {
                        match changed {
                            Ok(()) => {
                                if *online.borrow_and_update() {
                                    debug!("connectivity restored; draining queue");
                                    queue.process_queue().await;
                                }
                            }
                            // Connectivity source dropped; the workspace is
                            // shutting down.
                            Err(_) => break,
                        }
                    }
                    () = queue.wakeup.notified() => {
                        if *online.borrow() {
                            queue.process_queue().await;
                        }
                    }
                }
            }
        });

        ProcessingHandle { task }
    }

    fn refresh_pending_count(&self) {
        match self
            .db
            .with_conn(|conn| SqliteQueueRepository::new(conn).count_active(MAX_RETRIES))
        {
            Ok(count) => {
                self.pending_tx.send_replace(count);
            }
            Err(error) => warn!(%error, "failed to refresh pending count"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records applied paths; fails any path listed in `failing`.
    struct RecordingHandler {
        applied: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    impl RecordingHandler {
        fn new(failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                failing: failing.iter().map(ToString::to_string).collect(),
            })
        }

        fn applied(&self) -> Vec<String> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperationHandler for RecordingHandler {
        async fn apply(&self, operation: &PendingOperation) -> Result<()> {
            self.applied.lock().unwrap().push(operation.path.clone());
            if self.failing.contains(&operation.path) {
                return Err(Error::InvalidInput("always fails".to_string()));
            }
            Ok(())
        }
    }

    struct UnauthenticatedHandler;

    #[async_trait]
    impl OperationHandler for UnauthenticatedHandler {
        async fn apply(&self, _operation: &PendingOperation) -> Result<()> {
            Err(Error::Unauthenticated)
        }
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({"content": "x", "sidecar": "{}"})
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replays_in_enqueue_order_and_removes_on_success() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let handler = RecordingHandler::new(&[]);
        let queue = OperationQueue::new(db, handler.clone()).unwrap();

        queue
            .enqueue(OperationKind::Update, "notes/a.md", payload())
            .unwrap();
        queue
            .enqueue(OperationKind::Delete, "notes/a.md", payload())
            .unwrap();
        queue
            .enqueue(OperationKind::Update, "notes/b.md", payload())
            .unwrap();
        assert_eq!(queue.pending_len(), 3);

        queue.process_queue().await;

        assert_eq!(handler.applied(), vec!["notes/a.md", "notes/a.md", "notes/b.md"]);
        assert!(queue.pending().unwrap().is_empty());
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replay_order_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let db = Arc::new(Database::open(&path).unwrap());
            let queue = OperationQueue::new(db, RecordingHandler::new(&[])).unwrap();
            queue
                .enqueue(OperationKind::Update, "notes/a.md", payload())
                .unwrap();
            queue
                .enqueue(OperationKind::Delete, "notes/a.md", payload())
                .unwrap();
        }

        // "Restart": reopen the database and a fresh queue over it.
        let db = Arc::new(Database::open(&path).unwrap());
        let handler = RecordingHandler::new(&[]);
        let queue = OperationQueue::new(db, handler.clone()).unwrap();

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, OperationKind::Update);
        assert_eq!(pending[1].kind, OperationKind::Delete);

        queue.process_queue().await;
        assert_eq!(handler.applied(), vec!["notes/a.md", "notes/a.md"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn poison_entry_does_not_block_the_rest() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let handler = RecordingHandler::new(&["notes/poison.md"]);
        let queue = OperationQueue::new(db, handler.clone()).unwrap();

        queue
            .enqueue(OperationKind::Update, "notes/poison.md", payload())
            .unwrap();
        queue
            .enqueue(OperationKind::Update, "notes/ok.md", payload())
            .unwrap();

        queue.process_queue().await;

        // The healthy entry replayed despite the earlier failure
        assert_eq!(handler.applied(), vec!["notes/poison.md", "notes/ok.md"]);
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "notes/poison.md");
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("Invalid input: always fails"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_ceiling_parks_operations_without_deleting_them() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let handler = RecordingHandler::new(&["notes/bad.md"]);
        let queue = OperationQueue::new(db, handler.clone()).unwrap();

        queue
            .enqueue(OperationKind::Update, "notes/bad.md", payload())
            .unwrap();

        for _ in 0..7 {
            queue.process_queue().await;
        }

        // Attempted exactly MAX_RETRIES times, then skipped
        assert_eq!(handler.applied().len(), 5);
        let stuck = queue.stuck().unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].retry_count, 5);
        // Parked entries no longer count toward the pending signal
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthenticated_state_burns_no_retries() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = OperationQueue::new(db, Arc::new(UnauthenticatedHandler)).unwrap();

        queue
            .enqueue(OperationKind::Update, "notes/a.md", payload())
            .unwrap();
        queue
            .enqueue(OperationKind::Update, "notes/b.md", payload())
            .unwrap();

        queue.process_queue().await;

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|operation| operation.retry_count == 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn processing_handle_stops_the_background_task() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = OperationQueue::new(db, RecordingHandler::new(&[])).unwrap();
        let (online_tx, online_rx) = watch::channel(true);

        let handle = queue.start_processing(Duration::from_secs(3600), online_rx);
        handle.stop();

        // After stop, connectivity transitions reach no listener; sending
        // must not panic and the queue stays usable.
        online_tx.send_replace(false);
        online_tx.send_replace(true);
        queue
            .enqueue(OperationKind::Update, "notes/a.md", payload())
            .unwrap();
        assert_eq!(queue.pending_len(), 1);
    }
}
