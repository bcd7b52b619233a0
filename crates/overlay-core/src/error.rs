use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid store document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("overlay {0} not found")]
    OverlayNotFound(String),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("an active overlay already exists for {0}")]
    AlreadyExists(String),

    #[error("overlay {0} is archived")]
    OverlayArchived(String),

    /// The backing store could not be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
