//! Append-only engine logs and their cross-instance replay.
//!
//! Every engine log (`activity/<instanceId>.log`,
//! `deleted/<instanceId>.log`, `moves/<instanceId>.log`) is a file
//! header followed by crc-framed records. Writers only ever touch
//! their own file; readers tail peer files from persisted watermarks.

pub mod activity;
pub mod activity_sync;
pub mod deletion;
pub mod frame;
pub mod header;
pub mod record;

use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CacheError;
use crate::core::{InstanceId, WatermarkError};
use crate::crdt::DocError;
use crate::error::Transience;

pub use activity::ActivityLogger;
pub use activity_sync::ActivitySync;
pub use deletion::{DeletionLogger, DeletionSync};
pub use frame::{FrameReader, encode_frame};
pub use header::{LOG_FORMAT_VERSION, LogHeader};
pub use record::{ActivityRecord, DeletionRecord};

pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error{}: {source}", fmt_path(.path))]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("frame magic mismatch (got {got:#x})")]
    FrameMagicMismatch { got: u32 },
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame crc mismatch (expected {expected:#x}, got {got:#x}, {length} byte body)")]
    FrameCrcMismatch {
        expected: u32,
        got: u32,
        length: usize,
    },
    #[error("record exceeds max size (max {max_bytes}, got {got_bytes})")]
    RecordTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("record header invalid: {reason}")]
    RecordHeaderInvalid { reason: String },
    #[error("log file header invalid at {path:?}: {reason}")]
    FileHeaderInvalid { path: PathBuf, reason: String },
    #[error("log file {path:?} written by {got}, expected {expected}")]
    WriterMismatch {
        path: PathBuf,
        expected: InstanceId,
        got: InstanceId,
    },
    #[error("own log {path:?} is corrupt past offset {offset}: {reason}")]
    OwnLogCorrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },
    #[error(transparent)]
    Watermark(#[from] WatermarkError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Doc(#[from] DocError),
}

impl LogError {
    pub fn transience(&self) -> Transience {
        match self {
            LogError::Io { .. } => Transience::Retryable,
            LogError::Cache(e) => e.transience(),
            LogError::Doc(e) => e.transience(),
            _ => Transience::Permanent,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" at {p:?}"),
        None => String::new(),
    }
}
