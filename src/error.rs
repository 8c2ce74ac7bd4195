use thiserror::Error;

/// Failures that propagate to callers. Network-level failures never show up
/// here; the probes turn them into negative results.
#[derive(Error, Debug)]
pub enum LanWatchError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    StoreCorrupt(String),
}

pub type Result<T, E = LanWatchError> = std::result::Result<T, E>;
