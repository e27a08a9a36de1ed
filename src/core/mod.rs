//! Core domain types.
//!
//! Module order follows type dependency:
//! - time: wall-clock stamps
//! - identity: uuid-backed id atoms
//! - limits: normative defaults
//! - watermark: per-peer replay cursors
//! - tombstone: permanent-deletion records

pub mod error;
pub mod identity;
pub mod limits;
pub mod time;
pub mod tombstone;
pub mod watermark;

pub use error::{CoreError, InvalidId};
pub use identity::{FolderId, InstanceId, MoveId, NoteId, SdId};
pub use limits::Limits;
pub use time::WallClock;
pub use tombstone::Tombstone;
pub use watermark::{LogKind, Watermark, WatermarkError, Watermarks};
