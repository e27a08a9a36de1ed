//! Per-peer replay cursors.
//!
//! A watermark records how far this instance has replayed one peer's
//! log: the peer's last applied sequence, the byte offset just past
//! that record, and the log epoch the offset is valid for. Sequences
//! survive compaction; byte offsets do not, which is why the epoch is
//! part of the cursor.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::identity::InstanceId;

/// Which engine log a cursor tracks. Move logs are not listed: they
/// are small enough to fold by full rescan and carry no cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Activity,
    Deletion,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Activity => "activity",
            LogKind::Deletion => "deletion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activity" => Some(LogKind::Activity),
            "deletion" => Some(LogKind::Deletion),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    epoch: u64,
    seq: u64,
    offset: u64,
}

impl Watermark {
    /// Cursor for a log never read: epoch 0, nothing applied.
    pub fn genesis() -> Self {
        Self {
            epoch: 0,
            seq: 0,
            offset: 0,
        }
    }

    pub fn new(epoch: u64, seq: u64, offset: u64) -> Self {
        Self { epoch, seq, offset }
    }

    pub fn epoch(self) -> u64 {
        self.epoch
    }

    pub fn seq(self) -> u64 {
        self.seq
    }

    pub fn offset(self) -> u64 {
        self.offset
    }

    /// Advance past one applied record.
    ///
    /// Sequence must move strictly forward; gaps are legal (the writer
    /// compacted past records we had already applied) but moving
    /// backwards is not.
    pub fn advance(&mut self, seq: u64, offset: u64) -> Result<(), WatermarkError> {
        if seq <= self.seq {
            return Err(WatermarkError::SeqRegression {
                current: self.seq,
                got: seq,
            });
        }
        if offset < self.offset {
            return Err(WatermarkError::OffsetRegression {
                current: self.offset,
                got: offset,
            });
        }
        self.seq = seq;
        self.offset = offset;
        Ok(())
    }

    /// Re-anchor the byte offset after the writer compacted its log.
    ///
    /// The sequence is preserved; already-applied records are skipped
    /// by sequence during the rescan.
    pub fn rebase(&mut self, epoch: u64, offset: u64) -> Result<(), WatermarkError> {
        if epoch < self.epoch {
            return Err(WatermarkError::EpochRegression {
                current: self.epoch,
                got: epoch,
            });
        }
        self.epoch = epoch;
        self.offset = offset;
        Ok(())
    }
}

impl fmt::Debug for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Watermark(epoch {}, seq {}, offset {})",
            self.epoch, self.seq, self.offset
        )
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::genesis()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatermarkError {
    #[error("sequence must advance (current {current}, got {got})")]
    SeqRegression { current: u64, got: u64 },
    #[error("offset must not regress within an epoch (current {current}, got {got})")]
    OffsetRegression { current: u64, got: u64 },
    #[error("log epoch must not regress (current {current}, got {got})")]
    EpochRegression { current: u64, got: u64 },
}

/// Cursor table for one storage directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    inner: BTreeMap<LogKind, BTreeMap<InstanceId, Watermark>>,
}

impl Watermarks {
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }

    pub fn get(&self, kind: LogKind, origin: &InstanceId) -> Watermark {
        self.inner
            .get(&kind)
            .and_then(|origins| origins.get(origin))
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&mut self, kind: LogKind, origin: InstanceId, watermark: Watermark) {
        self.inner.entry(kind).or_default().insert(origin, watermark);
    }

    pub fn remove(&mut self, kind: LogKind, origin: &InstanceId) -> Option<Watermark> {
        self.inner.get_mut(&kind).and_then(|m| m.remove(origin))
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogKind, InstanceId, Watermark)> + '_ {
        self.inner.iter().flat_map(|(kind, origins)| {
            origins
                .iter()
                .map(move |(origin, wm)| (*kind, *origin, *wm))
        })
    }
}
