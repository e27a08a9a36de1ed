#![forbid(unsafe_code)]

//! Multi-instance convergence engine for a note collection shared
//! through a third-party folder-sync client.
//!
//! Instances never talk to each other: each one appends to its own
//! per-instance logs inside the shared directory tree, and replays
//! every peer's logs from persisted watermarks when files appear.
//! Convergence rests on three rules: per-writer records apply in
//! sequence order, document merges are idempotent under replay, and a
//! deletion tombstone beats any activity record for its note.

pub mod cache;
pub mod core;
pub mod crdt;
pub mod engine;
pub mod error;
pub mod log;
pub mod moves;
pub mod paths;
pub mod sd;
pub mod telemetry;
pub mod watch;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at the crate root.
pub use crate::cache::{NoteCache, NoteRow, SkippedEntry, WatermarkRow};
pub use crate::core::{
    FolderId, InstanceId, Limits, LogKind, MoveId, NoteId, SdId, Tombstone, WallClock, Watermark,
};
pub use crate::crdt::{CrdtDocument, DocError, DocumentRegistry, DocumentStore};
pub use crate::engine::{EngineError, SyncEngine};
pub use crate::log::{ActivityLogger, ActivitySync, DeletionLogger, DeletionSync, LogError};
pub use crate::moves::{MoveError, MoveManager, MoveState, MoveStatus};
pub use crate::telemetry::init_telemetry;
pub use crate::watch::{SyncPhase, SyncReport};
