//! Permanent-deletion tombstones.
//!
//! A tombstone wins unconditionally over any activity record for the
//! same note, regardless of timestamps. Tombstones are never removed.

use serde::{Deserialize, Serialize};

use super::identity::{InstanceId, NoteId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub note_id: NoteId,
    pub deleted_at_ms: u64,
    pub deleted_by: InstanceId,
}

impl Tombstone {
    pub fn new(note_id: NoteId, deleted_at_ms: u64, deleted_by: InstanceId) -> Self {
        Self {
            note_id,
            deleted_at_ms,
            deleted_by,
        }
    }

    /// Merge two tombstones for the same note: keep the earlier one,
    /// so the recorded deletion time is when the note first died.
    pub fn join(a: &Self, b: &Self) -> Self {
        debug_assert_eq!(a.note_id, b.note_id, "join requires same note");
        if a.deleted_at_ms <= b.deleted_at_ms { *a } else { *b }
    }
}
