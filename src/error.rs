use thiserror::Error;

use crate::cache::CacheError;
use crate::core::CoreError;
use crate::crdt::DocError;
use crate::engine::EngineError;
use crate::log::LogError;
use crate::moves::MoveError;
use crate::sd::SdError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred.
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Doc(#[from] DocError),

    #[error(transparent)]
    Sd(#[from] SdError),

    #[error(transparent)]
    Move(#[from] MoveError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Log(e) => e.transience(),
            Error::Cache(e) => e.transience(),
            Error::Doc(e) => e.transience(),
            Error::Sd(e) => e.transience(),
            Error::Move(e) => e.transience(),
            Error::Engine(e) => e.transience(),
        }
    }
}
