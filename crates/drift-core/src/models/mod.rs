//! Shared data models for the sync engine

mod conflict;
mod document;
mod operation;
mod usage;

pub use conflict::{
    is_local_conflict_id, ConflictDetail, ConflictResolution, ConflictSide, ResolutionReceipt,
    SyncConflict, UploadConflict,
};
pub use document::{
    DeleteReceipt, DocumentSnapshot, LocalVersionRecord, RemoteDocument, SyncDocument,
};
pub use operation::{
    DeletePayload, DocumentPayload, MovePayload, OperationId, OperationKind, PendingOperation,
};
pub use usage::SyncUsage;
