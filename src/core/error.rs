//! Core error taxonomy.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidId {
    #[error("note id `{raw}` is invalid: {reason}")]
    Note { raw: String, reason: String },
    #[error("instance id `{raw}` is invalid: {reason}")]
    Instance { raw: String, reason: String },
    #[error("storage directory id `{raw}` is invalid: {reason}")]
    Sd { raw: String, reason: String },
    #[error("folder id `{raw}` is invalid: {reason}")]
    Folder { raw: String, reason: String },
    #[error("move id `{raw}` is invalid: {reason}")]
    Move { raw: String, reason: String },
}

/// Canonical core error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
