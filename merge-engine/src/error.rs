//! Error types for the merge engine.

use thiserror::Error;

use crate::types::Language;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Structured processing refused the input.
    #[error("input too large for structural processing: {len} bytes (limit {limit})")]
    InputTooLarge { len: usize, limit: usize },

    #[error("could not parse {language} source")]
    ParseFailure { language: Language },

    #[error("malformed patch: {0}")]
    MalformedPatch(String),

    #[error("{failed} of {total} hunk(s) did not apply")]
    HunksRejected { failed: usize, total: usize },

    #[error("structural delta matched none of its {entries} entries")]
    DeltaUnmatched { entries: usize },

    #[error("invalid structural payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPatch(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
